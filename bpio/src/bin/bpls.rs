use std::fmt::Display;
use std::path::PathBuf;

use bpio::{
    Adios, AttributeDesc, Complex32, Complex64, DataType, Element, Engine, Io, Mode, ShapeId,
    VariableDesc,
};
use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(about = "List the variables and attributes of a binary-pack dataset")]
struct Cli {
    /// Dataset directory
    path: PathBuf,

    /// List attributes as well
    #[arg(short, long)]
    attributes: bool,

    /// Dump variable values
    #[arg(short, long)]
    dump: bool,

    /// Show min/max of every variable
    #[arg(short, long)]
    long: bool,

    /// Only variables and attributes whose name contains this
    #[arg(short, long)]
    filter: Option<String>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

/// Element types bpls knows how to print
trait Printable: Element + Display {
    fn to_json(&self) -> Value;
}

macro_rules! printable_numbers {
    ($($t:ty),*) => {
        $(impl Printable for $t {
            fn to_json(&self) -> Value {
                json!(self)
            }
        })*
    };
}

printable_numbers!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String);

impl Printable for Complex32 {
    fn to_json(&self) -> Value {
        json!([self.re, self.im])
    }
}

impl Printable for Complex64 {
    fn to_json(&self) -> Value {
        json!([self.re, self.im])
    }
}

/// Run `$body` with `$t` bound to the element type of `$dt`
macro_rules! with_type {
    ($dt:expr, $t:ident => $body:expr) => {
        match $dt {
            DataType::I8 => { type $t = i8; $body }
            DataType::I16 => { type $t = i16; $body }
            DataType::I32 => { type $t = i32; $body }
            DataType::I64 => { type $t = i64; $body }
            DataType::U8 => { type $t = u8; $body }
            DataType::U16 => { type $t = u16; $body }
            DataType::U32 => { type $t = u32; $body }
            DataType::U64 => { type $t = u64; $body }
            DataType::F32 => { type $t = f32; $body }
            DataType::F64 => { type $t = f64; $body }
            DataType::Complex32 => { type $t = Complex32; $body }
            DataType::Complex64 => { type $t = Complex64; $body }
            DataType::String => { type $t = String; $body }
        }
    };
}

struct Listing {
    min: Option<String>,
    max: Option<String>,
    min_json: Value,
    max_json: Value,
    values: Option<(String, Value)>,
}

fn describe<T: Printable>(
    engine: &mut Engine,
    io: &Io,
    desc: &VariableDesc,
    cli: &Cli,
) -> bpio::Result<Listing> {
    let var = io
        .inquire_variable::<T>(&desc.name)?
        .ok_or_else(|| bpio::Error::NotFound(format!("variable '{}'", desc.name)))?;

    let mut min: Option<T> = None;
    let mut max: Option<T> = None;
    if cli.long {
        for step in 0..engine.steps() {
            let Ok(blocks) = engine.blocks_info(&var, step) else {
                continue;
            };
            for b in blocks {
                let (lo, hi) = match (b.min, b.max, b.value) {
                    (Some(lo), Some(hi), _) => (lo, hi),
                    (_, _, Some(v)) => (v.clone(), v),
                    _ => continue,
                };
                min = Some(match min.take() {
                    Some(m) => T::min_max(&[m, lo.clone()]).map_or(lo, |(m, _)| m),
                    None => lo,
                });
                max = Some(match max.take() {
                    Some(m) => T::min_max(&[m, hi.clone()]).map_or(hi, |(_, m)| m),
                    None => hi,
                });
            }
        }
    }

    let values = if cli.dump {
        var.set_step_selection(0, desc.available_steps.max(1))?;
        let values = engine.get(&var)?;
        let text = values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let json = Value::Array(values.iter().map(Printable::to_json).collect());
        Some((text, json))
    } else {
        None
    };

    Ok(Listing {
        min_json: min.as_ref().map_or(Value::Null, Printable::to_json),
        max_json: max.as_ref().map_or(Value::Null, Printable::to_json),
        min: min.map(|m| m.to_string()),
        max: max.map(|m| m.to_string()),
        values,
    })
}

fn shape_text(desc: &VariableDesc) -> String {
    match desc.shape_id {
        ShapeId::GlobalValue => "scalar".to_string(),
        ShapeId::LocalValue => {
            format!("[{}] local values", desc.shape.first().copied().unwrap_or(0))
        }
        ShapeId::LocalArray => format!("local block {:?}", desc.count),
        ShapeId::GlobalArray | ShapeId::JoinedArray => format!("{:?}", desc.shape),
    }
}

fn attribute_text(attr: &AttributeDesc) -> bpio::Result<(String, Value)> {
    with_type!(attr.data_type, T => {
        let values = T::decode(&attr.value)?;
        let text = values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let json = Value::Array(values.iter().map(Printable::to_json).collect());
        if attr.is_array {
            Ok((format!("{{{text}}}"), json))
        } else {
            Ok((text, json.as_array().and_then(|a| a.first().cloned()).unwrap_or(Value::Null)))
        }
    })
}

fn run(cli: &Cli) -> bpio::Result<()> {
    let adios = Adios::default();
    let io = adios.declare_io("bpls")?;
    let path = cli.path.to_string_lossy().into_owned();
    let mut engine = io.open(&path, Mode::ReadRandomAccess)?;

    let matches = |name: &str| cli.filter.as_deref().map_or(true, |f| name.contains(f));
    let mut variables = Vec::new();
    for desc in io.available_variables().into_iter().filter(|d| matches(&d.name)) {
        let listing = with_type!(desc.data_type, T => describe::<T>(&mut engine, &io, &desc, cli)?);
        variables.push((desc, listing));
    }
    let mut attributes = Vec::new();
    if cli.attributes {
        for attr in io.available_attributes().into_iter().filter(|a| matches(&a.name)) {
            let rendered = attribute_text(&attr)?;
            attributes.push((attr, rendered));
        }
    }

    if cli.json {
        let doc = json!({
            "path": path,
            "steps": engine.steps(),
            "variables": variables.iter().map(|(d, l)| {
                let mut v = json!({
                    "name": d.name,
                    "type": d.data_type.to_string(),
                    "shape_id": format!("{:?}", d.shape_id),
                    "shape": d.shape,
                    "steps": d.available_steps,
                });
                if cli.long {
                    v["min"] = l.min_json.clone();
                    v["max"] = l.max_json.clone();
                }
                if let Some((_, values)) = &l.values {
                    v["values"] = values.clone();
                }
                v
            }).collect::<Vec<_>>(),
            "attributes": attributes.iter().map(|(a, (_, value))| json!({
                "name": a.name,
                "type": a.data_type.to_string(),
                "value": value,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default());
    } else {
        for (desc, listing) in &variables {
            let mut line = format!(
                "  {:<10} {:<24} {}*{}",
                desc.data_type.to_string(),
                desc.name,
                desc.available_steps,
                shape_text(desc)
            );
            if let (Some(min), Some(max)) = (&listing.min, &listing.max) {
                line.push_str(&format!(" = {min} / {max}"));
            }
            println!("{line}");
            if let Some((values, _)) = &listing.values {
                println!("    {values}");
            }
        }
        for (attr, (text, _)) in &attributes {
            println!("  {:<10} {:<24} attr = {text}", attr.data_type.to_string(), attr.name);
        }
    }
    engine.close()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("bpls: {err}");
        std::process::exit(1);
    }
}
