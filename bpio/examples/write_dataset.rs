//! Write a small heat-diffusion dataset from four in-process ranks

use std::thread;
use std::time::Instant;

use bpio::{Adios, Comm, Mode, ThreadComm};

const RANKS: usize = 4;
const NX: u64 = 64;
const STEPS: u64 = 10;

fn main() -> bpio::Result<()> {
    env_logger::init();
    let filename = "heat.bp";
    println!("Writing {STEPS} steps of a {NX}-cell rod from {RANKS} ranks to '{filename}'...");

    let adios = Adios::default();
    let start = Instant::now();
    let results: Vec<bpio::Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = ThreadComm::create(RANKS)
            .into_iter()
            .map(|comm| {
                let adios = adios.clone();
                scope.spawn(move || write_rank(&adios, comm, filename))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(bpio::Error::InvalidArgument("rank panicked".into())))
            })
            .collect()
    });
    results.into_iter().collect::<bpio::Result<Vec<()>>>()?;

    println!("Dataset written in {:?}", start.elapsed());
    println!("\nRun 'cargo run --example read_dataset' to read it back!");
    Ok(())
}

fn write_rank(adios: &Adios, comm: ThreadComm, filename: &str) -> bpio::Result<()> {
    let rank = comm.rank() as u64;
    let local = NX / RANKS as u64;
    let io = adios.declare_io(&format!("writer-{rank}"))?;
    io.set_parameters([("AggregationType", "TwoLevelShm"), ("NumAggregators", "2")]);
    if rank == 0 {
        io.define_attribute("units", String::from("kelvin"))?;
        io.define_attribute_array("rod_length_m", &[1.5f64])?;
    }

    let temperature = io.define_variable::<f64>("T", &[NX], &[rank * local], &[local], true)?;
    let step_var = io.define_variable::<u64>("step", &[], &[], &[], true)?;

    let mut cells: Vec<f64> = (0..local)
        .map(|i| if rank * local + i < NX / 2 { 100.0 } else { 0.0 })
        .collect();
    let mut writer = io.open_with_comm(filename, Mode::Write, Box::new(comm))?;
    for step in 0..STEPS {
        writer.begin_step()?;
        writer.put(&temperature, &cells, Mode::Deferred)?;
        if rank == 0 {
            writer.put(&step_var, &[step], Mode::Sync)?;
        }
        writer.end_step()?;
        relax(&mut cells);
    }
    writer.close()
}

/// One smoothing pass within the rank's own cells
fn relax(cells: &mut [f64]) {
    let previous = cells.to_vec();
    for i in 1..cells.len().saturating_sub(1) {
        cells[i] = 0.25 * previous[i - 1] + 0.5 * previous[i] + 0.25 * previous[i + 1];
    }
}
