mod config;
mod simulation;

use anyhow::Result;
use clap::Parser;

use config::SimConfig;
use simulation::Simulation;

#[derive(Parser)]
#[command(name = "canopy-sim")]
#[command(about = "Headless authority/client replication run over a loopback hub")]
struct Args {
    #[arg(short, long, default_value_t = 2)]
    clients: usize,

    #[arg(short, long, default_value_t = 10.0)]
    seconds: f32,

    #[arg(short, long, default_value_t = 60)]
    frame_rate: u32,

    #[arg(long, default_value_t = 50, help = "Delta cycle period in ms")]
    update_interval_ms: u64,

    #[arg(long, default_value_t = 4, help = "Crates orbiting on the authority")]
    crates: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SimConfig {
        clients: args.clients,
        seconds: args.seconds,
        frame_rate: args.frame_rate,
        update_interval_ms: args.update_interval_ms,
        crates: args.crates,
        ..Default::default()
    };

    let frame = config.frame_duration();
    let total_frames = config.total_frames();
    let mut simulation = Simulation::new(config)?;
    log::info!("running {total_frames} frames");

    let mut interval = tokio::time::interval(frame);
    for _ in 0..total_frames {
        tokio::select! {
            _ = interval.tick() => simulation.frame(frame.as_secs_f32())?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
        }
    }

    if !simulation.report() {
        log::warn!("clients diverged from the authority");
    }
    simulation.shutdown()?;
    log::info!("simulation finished");
    Ok(())
}
