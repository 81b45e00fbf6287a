//! Read back the dataset produced by the write_dataset example

use std::time::Instant;

use bpio::{Adios, Mode, StepStatus};

fn main() -> bpio::Result<()> {
    env_logger::init();
    let filename = "heat.bp";

    if !std::path::Path::new(filename).exists() {
        println!("Dataset '{filename}' not found!");
        println!("   Run 'cargo run --example write_dataset' first");
        return Ok(());
    }

    let adios = Adios::default();

    // step by step, the way a live consumer would
    println!("Following '{filename}' step by step...");
    let io = adios.declare_io("follower")?;
    let mut reader = io.open(filename, Mode::Read)?;
    while reader.begin_step()? == StepStatus::Ok {
        let t = io
            .inquire_variable::<f64>("T")?
            .ok_or_else(|| bpio::Error::NotFound("variable 'T'".into()))?;
        let values = reader.get(&t)?;
        let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
        println!("   step {:>2}: mean temperature {mean:.3}", reader.current_step());
        reader.end_step()?;
    }
    reader.close()?;

    // random access: one cell across every step
    let io = adios.declare_io("random")?;
    let start = Instant::now();
    let mut reader = io.open(filename, Mode::ReadRandomAccess)?;
    let t = io
        .inquire_variable::<f64>("T")?
        .ok_or_else(|| bpio::Error::NotFound("variable 'T'".into()))?;
    let steps = t.steps();
    t.set_selection(&[31], &[1])?;
    t.set_step_selection(0, steps)?;
    let history = reader.get(&t)?;
    println!("\nCell 31 over {steps} steps ({:?}):", start.elapsed());
    println!("   {history:.2?}");

    for attr in io.available_attributes() {
        println!("Attribute {} ({})", attr.name, attr.data_type);
    }
    reader.close()
}
