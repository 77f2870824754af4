use std::sync::Arc;
use clap::Parser;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use nsamr::amr::{Checkpoint, Hierarchy};
use nsamr::config::Config;
use nsamr::derive::sum_integrated_quantities;
use nsamr::error::Result;
use nsamr::index_space::{range2d, IndexSpace};
use nsamr::problem::{Problem, TaylorGreen};




#[derive(Debug, Parser)]
#[clap(version = "1.0")]
struct Opts {
    #[clap(short = 'n', long, default_value = "32")]
    num_zones: i64,

    #[clap(short = 'l', long, default_value = "2")]
    num_levels: usize,

    #[clap(short = 't', long, default_value = "0.5")]
    stop_time: f64,

    #[clap(long, default_value = "0.001")]
    viscosity: f64,

    #[clap(long, default_value = "50")]
    checkpoint_interval: usize,

    /// Read the run configuration from a CBOR file
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Restart from a checkpoint file
    #[clap(short = 'r', long)]
    restart: Option<String>,

    #[clap(short = 'v', long)]
    verbose: bool,
}




/**
 * Boxes for each level: the base level covers the domain and each finer
 * level covers the middle half of the one below it.
 */
fn nested_boxes(num_zones: i64, num_levels: usize, ratio: i64) -> Vec<Vec<IndexSpace>> {
    let mut boxes = vec![vec![range2d(0..num_zones, 0..num_zones)]];
    let (mut lo, mut hi) = (0, num_zones);

    for _ in 1..num_levels {
        let inset = (hi - lo) / 4;
        lo = (lo + inset) * ratio;
        hi = (hi - inset) * ratio;
        boxes.push(vec![range2d(lo..hi, lo..hi)]);
    }
    boxes
}




fn run(opts: Opts) -> Result<()> {
    let problem: Arc<dyn Problem> = Arc::new(TaylorGreen { amplitude: 1.0, density: 1.0 });

    let mut hierarchy = match &opts.restart {
        Some(path) => {
            info!("restarting from {}", path);
            Hierarchy::from_checkpoint(Checkpoint::read(path)?, problem)?
        }
        None => {
            let config = match &opts.config {
                Some(path) => Config::load(path)?,
                None => Config { visc_coef: opts.viscosity, ..Config::default() },
            };
            let boxes = nested_boxes(opts.num_zones, opts.num_levels, config.ref_ratio);
            let mut hierarchy = Hierarchy::new(Arc::new(config), problem, (0.0..1.0, 0.0..1.0), (opts.num_zones, opts.num_zones), boxes)?;
            hierarchy.initialize()?;
            hierarchy
        }
    };

    sum_integrated_quantities(&hierarchy);

    while hierarchy.time() < opts.stop_time {
        let start = std::time::Instant::now();
        let dt = hierarchy.advance()?;
        let seconds = start.elapsed().as_secs_f64();

        info!("[{:05}] t={:.5} dt={:.3e} Mzps={:.3}", hierarchy.step(), hierarchy.time(), dt, zones(&hierarchy) as f64 * 1e-6 / seconds);

        if hierarchy.step() % opts.checkpoint_interval == 0 {
            let fname = format!("chkpt.{:04}.cbor", hierarchy.step() / opts.checkpoint_interval);
            hierarchy.checkpoint().write(&fname)?;
            info!("write {}", fname);
            sum_integrated_quantities(&hierarchy);
        }
    }

    sum_integrated_quantities(&hierarchy);
    hierarchy.checkpoint().write("chkpt.final.cbor")?;
    Ok(())
}




fn zones(hierarchy: &Hierarchy) -> usize {
    hierarchy
        .levels()
        .iter()
        .flat_map(|level| level.layout.boxes())
        .map(|b| b.len())
        .sum()
}




fn main() {
    let opts = Opts::parse();
    let level = if opts.verbose { LevelFilter::Debug } else { LevelFilter::Info };

    SimpleLogger::new().with_level(level).init().unwrap();

    if let Err(e) = run(opts) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
