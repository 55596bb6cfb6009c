use anyhow::{bail, Result};
use clap::Parser;
use crossbeam_channel::tick;
use log::{error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use spectro_daq::{
    tui::Status, utils::Counter, Conf, MemorySink, Session, SessionHooks, SessionState,
    SimulatedSpectrometer, SpectrumSink,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "spectro-daq")]
#[command(about = "Acquisition console for FFT spectrometers", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run without the terminal UI and log to stderr
    #[arg(long)]
    headless: bool,

    /// Measurements to collect in headless mode
    #[arg(short = 'n', long, default_value_t = 10)]
    measurements: u64,

    /// Override the configured acquisition mode with continuous acquisition
    #[arg(long)]
    continuous: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Conf::load(cli.config.as_deref())?;
    init_logging(&conf, cli.headless)?;

    let mut device_settings = conf.simulator_settings();
    if cli.continuous {
        device_settings.continuous = true;
    }
    let resource = device_settings.resource.clone();
    let device = SimulatedSpectrometer::new(device_settings);

    let sink: Box<dyn SpectrumSink> = if conf.data_logging.enabled {
        file_sink(&conf.output_dir())?
    } else {
        Box::new(MemorySink::new())
    };

    let mut session = Session::new(device, sink, conf.session_settings(), SessionHooks::default());
    session.initialize()?;
    session.connect(&resource);
    if !session.events().connect.wait_timeout(EVENT_TIMEOUT) {
        let reason = session
            .connection()
            .last_error()
            .map_or_else(|| "timed out".to_string(), |e| e.to_string());
        session.terminate();
        bail!("Could not connect to {resource}: {reason}");
    }

    let result = if cli.headless {
        run_headless(&session, cli.measurements)
    } else {
        let mut terminal = ratatui::init();
        let result = Status::new(&session, resource).run(&mut terminal);
        ratatui::restore();
        result
    };

    if let Err(e) = &result {
        error!("{e}");
    }
    session.terminate();
    result
}

fn init_logging(conf: &Conf, headless: bool) -> Result<()> {
    let level = LevelFilter::from(conf.logging.level);
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        level,
        Config::default(),
        File::create(&conf.logging.file)?,
    )];
    if headless {
        loggers.push(TermLogger::new(
            level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

#[cfg(feature = "hdf5")]
fn file_sink(output_dir: &Path) -> Result<Box<dyn SpectrumSink>> {
    Ok(Box::new(spectro_daq::HDF5Writer::new(output_dir)?))
}

#[cfg(not(feature = "hdf5"))]
fn file_sink(output_dir: &Path) -> Result<Box<dyn SpectrumSink>> {
    bail!(
        "Data logging to {} requires the hdf5 feature",
        output_dir.display()
    )
}

/// Acquires until `target` measurements were transferred, restarting after
/// every one-shot acquisition.
fn run_headless(session: &Session<SimulatedSpectrometer>, target: u64) -> Result<()> {
    let ticker = tick(Duration::from_millis(100));
    let mut counter = Counter::new();
    let mut collected = 0;

    while collected < target {
        let events = session.events();
        events.start.clear();
        events.stop.clear();
        session.start();
        if !events.start.wait_timeout(EVENT_TIMEOUT) {
            bail!("Acquisition did not start");
        }

        let mut last_ok = 0;
        let mut stopping = false;
        loop {
            let _ = ticker.recv();
            let stats = session.statistics();
            counter.increment(stats.ok.saturating_sub(last_ok));
            last_ok = stats.ok;

            if !stopping
                && collected + stats.ok >= target
                && session.state() == SessionState::Acquiring
            {
                session.stop();
                stopping = true;
            }
            if events.stop.take() {
                break;
            }
        }

        let stats = session.statistics();
        collected += stats.ok;
        info!(
            "Acquisition finished: ok={} dropped={} blocked={} total={} ({:.2} /s)",
            stats.ok,
            stats.dropped,
            stats.blocked,
            stats.total,
            counter.average_rate()
        );
        if let Some(fault) = session.acquisition().last_fault() {
            bail!("Acquisition fault: {fault}");
        }
        if stats.ok == 0 {
            bail!("Acquisition stopped without measurements");
        }
    }

    info!(
        "Collected {} measurements, {} logged",
        collected,
        session.logger().stored()
    );
    Ok(())
}
