use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};

use rdsim_common::{OutputConfig, SimulationConfig, Snapshot};
use rdsim_engine::Simulation;

/// Minimum wall time between two progress lines.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    info!("Reading configuration from '{}'", config_path);
    let config = SimulationConfig::load(&config_path)?;
    info!("Displacement phase runs on {} rayon threads.", rayon::current_num_threads());

    let mut sim = Simulation::from_config(&config)?;
    info!(
        "Ready: {} molecules, {} species, {} reactions.",
        sim.molecule_count(),
        sim.species().len(),
        sim.reactions().len()
    );
    debug!("Runtime parameters: {:#?}", sim.params());
    for (id, reaction) in sim.reactions().iter() {
        if let Some(solved) = reaction.solved() {
            debug!(
                "#{} '{}': p = {:.4e}, capture radius = {:.4e}, unbinding radius = {:.4e}",
                id, reaction.name, solved.probability, solved.capture_radius, solved.unbinding_radius
            );
        }
    }

    // --- Schedule ---
    let dt = sim.params().dt;
    let total_steps = (config.timing.total_time / dt).ceil() as u64;
    let record_every = match (config.timing.record_interval.max(0.0) / dt).round() as u64 {
        0 => {
            warn!(
                "record_interval {:.3e} is below dt {:.3e}; recording after every step.",
                config.timing.record_interval, dt
            );
            1
        }
        n => n,
    };
    info!("Running {} steps, snapshot every {} steps.", total_steps, record_every);

    sim.record_snapshot().context("initial snapshot")?;
    let started = Instant::now();
    let mut last_report = started;

    for step in 1..=total_steps {
        let tick = Instant::now();
        sim.step().with_context(|| format!("step {}", step))?;
        let tick_time = tick.elapsed();

        let record = step % record_every == 0 || step == total_steps;
        if record {
            sim.record_snapshot().with_context(|| format!("snapshot at step {}", step))?;
        }
        if record || last_report.elapsed() >= PROGRESS_INTERVAL {
            info!(
                "[{}/{}] t = {:.4e} | {} molecules | {:6.2} ms/step | {:.2} s elapsed",
                step,
                total_steps,
                sim.time(),
                sim.molecule_count(),
                tick_time.as_secs_f64() * 1000.0,
                started.elapsed().as_secs_f64()
            );
            last_report = Instant::now();
        } else {
            trace!("step {} took {:.2} ms", step, tick_time.as_secs_f64() * 1000.0);
        }
    }

    info!("Finished {} steps in {:.3} s.", total_steps, started.elapsed().as_secs_f64());
    for (id, reaction) in sim.reactions().iter() {
        info!("  {:<20} {} events", reaction.name, sim.reaction_events(id));
    }

    let output = &config.output;
    if output.save_stats {
        write_snapshots(output, sim.get_recorded_snapshots());
    } else {
        info!("save_stats is off; snapshots not written.");
    }
    if output.save_positions {
        write_positions(output, &sim)?;
    }
    Ok(())
}

/// Writes the recorded snapshots as JSON, bincode or MessagePack.
fn write_snapshots(output: &OutputConfig, snapshots: &[Snapshot]) {
    let format = output.format.as_deref().unwrap_or("json");
    let (extension, result) = match format {
        "bincode" => {
            let filename = format!("{}_snapshots.bin", output.base_filename);
            let result = File::create(&filename)
                .map_err(anyhow::Error::from)
                .and_then(|file| bincode::serialize_into(file, snapshots).map_err(anyhow::Error::from));
            ("bin", result)
        }
        "messagepack" => {
            let filename = format!("{}_snapshots.msgpack", output.base_filename);
            let result = File::create(&filename)
                .map_err(anyhow::Error::from)
                .and_then(|mut file| rmp_serde::encode::write(&mut file, snapshots).map_err(anyhow::Error::from));
            ("msgpack", result)
        }
        other => {
            if other != "json" {
                warn!("Unknown output format '{}', writing JSON.", other);
            }
            let filename = format!("{}_snapshots.json", output.base_filename);
            let result = serde_json::to_string(snapshots).map_err(anyhow::Error::from).and_then(|json| {
                let mut file = File::create(&filename)?;
                file.write_all(json.as_bytes())?;
                Ok(())
            });
            ("json", result)
        }
    };
    let filename = format!("{}_snapshots.{}", output.base_filename, extension);
    match result {
        Ok(()) => info!("Wrote {} snapshots to {}", snapshots.len(), filename),
        Err(e) => error!("Could not write {}: {}", filename, e),
    }
}

/// Final molecule positions as CSV: serial, species, state, x, y, z.
fn write_positions(output: &OutputConfig, sim: &Simulation) -> Result<()> {
    let filename = format!("{}_final_positions.csv", output.base_filename);
    let mut writer = csv::Writer::from_path(&filename).with_context(|| format!("creating {}", filename))?;
    writer.write_record(["serial", "species", "state", "x", "y", "z"])?;
    for m in sim.molecule_records() {
        let [x, y, z] = m.position;
        writer.write_record(&[
            m.serial.to_string(),
            m.species,
            m.state,
            format!("{:.6e}", x),
            format!("{:.6e}", y),
            format!("{:.6e}", z),
        ])?;
    }
    writer.flush()?;
    info!("Wrote final positions to {}", filename);
    Ok(())
}
