use std::{fs::File, io::BufWriter, path::PathBuf};

use clap::{Parser, Subcommand};
use cr30::{
    chart::{Chart, CsvSink, JsonSink, MeasurementSink},
    config::Config,
    session::SessionOptions,
    transport::serialport::{available_ports, SerialTransport},
    ColorSpace, DeviceSession, MeasurementOrchestrator, Viewing,
};

#[derive(Parser)]
#[command(name = "cr30")]
#[command(about = "CR30 colorimeter CLI", long_about = None)]
struct Cr30Cli {
    /// Serial port of the instrument
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Connect and print the device information
    Info,

    /// Run white and/or black calibration (both when neither is given)
    Calibrate {
        #[arg(long)]
        white: bool,

        #[arg(long)]
        black: bool,
    },

    /// Take one measurement
    Measure {
        /// XYZ, LAB or RGB
        #[arg(short, long)]
        space: Option<ColorSpace>,

        /// Illuminant and observer, e.g. D50/2
        #[arg(short, long)]
        illuminant: Option<Viewing>,

        /// Captures to average
        #[arg(short = 'n', long)]
        count: Option<u32>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Measure a series of samples, one button press each
    Batch {
        #[arg(short = 'n', long)]
        count: usize,

        /// JSON output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Measure the patches of a chart in order
    Chart {
        /// Comma separated patch ids
        #[arg(long, value_delimiter = ',', required = true)]
        patches: Vec<String>,

        /// Output file; `.json` selects JSON, anything else CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<cr30::Error>> {
    let cli = Cr30Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.device.port = port;
    }
    if let Some(baud) = cli.baud {
        config.device.baud_rate = baud;
    }

    match cli.command {
        Commands::Ports => list_ports()?,
        Commands::Info => info(&config).await?,
        Commands::Calibrate { white, black } => calibrate(&config, white, black).await?,
        Commands::Measure { space, illuminant, count, json } => {
            measure(&config, space, illuminant, count, json).await?
        }
        Commands::Batch { count, output } => batch(&config, count, output).await?,
        Commands::Chart { patches, output } => chart(&config, patches, output).await?,
    }

    Ok(())
}

fn list_ports() -> Result<(), Box<cr30::Error>> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{}\t{}", port.name, port.description);
    }
    Ok(())
}

async fn connect(config: &Config) -> Result<DeviceSession<SerialTransport>, cr30::Error> {
    let transport = SerialTransport::new(config.device.port.clone(), config.device.baud_rate);
    let mut session = DeviceSession::new(transport, SessionOptions::from(config));
    session.connect().await?;
    if let Err(e) = session.handshake().await {
        let _ = session.disconnect().await;
        return Err(e);
    }
    Ok(session)
}

async fn info(config: &Config) -> Result<(), Box<cr30::Error>> {
    let mut session = connect(config).await?;
    if let Some(info) = session.info() {
        println!("Name:     {}", info.name);
        println!("Model:    {}", info.model);
        println!("Serial:   {}", info.serial);
        println!("Firmware: {}", info.firmware);
        println!("Build:    {}", info.build);
    }
    session.disconnect().await?;
    Ok(())
}

async fn calibrate(config: &Config, white: bool, black: bool) -> Result<(), Box<cr30::Error>> {
    let (white, black) = if white || black { (white, black) } else { (true, true) };
    let mut session = connect(config).await?;
    let reports = session.calibrate(white, black).await;
    session.disconnect().await?;
    for report in reports? {
        let outcome = if report.success { "ok" } else { "FAILED" };
        println!("{} calibration: {outcome} (status {:#04x})", report.target, report.status);
    }
    Ok(())
}

async fn measure(
    config: &Config,
    space: Option<ColorSpace>,
    viewing: Option<Viewing>,
    count: Option<u32>,
    json: bool,
) -> Result<(), Box<cr30::Error>> {
    let space = match space {
        Some(space) => space,
        None => config.space()?,
    };
    let viewing = match viewing {
        Some(viewing) => viewing,
        None => config.viewing()?,
    };
    let count = count.unwrap_or(config.measurement.averaging_count);

    let session = connect(config).await?;
    let mut orchestrator = MeasurementOrchestrator::from_config(session, config);
    let result = orchestrator.measure(space, viewing, count).await;
    orchestrator.session_mut().disconnect().await?;
    let result = result?;

    if json {
        println!("{}", result.to_json()?);
    } else {
        println!("{result}");
        for warning in &result.warnings {
            println!("warning: {warning}");
        }
    }
    Ok(())
}

async fn batch(config: &Config, count: usize, output: Option<PathBuf>) -> Result<(), Box<cr30::Error>> {
    let chart = Chart::from_ids((1..=count).map(|i| format!("sample-{i}")));
    let mut sink: Box<dyn MeasurementSink> = match output {
        Some(path) => Box::new(JsonSink::new(BufWriter::new(File::create(path).map_err(cr30::Error::from)?))),
        None => Box::new(JsonSink::new(std::io::stdout())),
    };
    read_chart(config, &chart, sink.as_mut()).await
}

async fn chart(config: &Config, patches: Vec<String>, output: Option<PathBuf>) -> Result<(), Box<cr30::Error>> {
    let chart = Chart::from_ids(patches);
    let mut sink: Box<dyn MeasurementSink> = match output {
        Some(path) if path.extension().is_some_and(|ext| ext == "json") => {
            Box::new(JsonSink::new(BufWriter::new(File::create(path).map_err(cr30::Error::from)?)))
        }
        Some(path) => Box::new(CsvSink::new(BufWriter::new(File::create(path).map_err(cr30::Error::from)?))),
        None => Box::new(CsvSink::new(std::io::stdout())),
    };
    read_chart(config, &chart, sink.as_mut()).await
}

async fn read_chart(config: &Config, chart: &Chart, sink: &mut dyn MeasurementSink) -> Result<(), Box<cr30::Error>> {
    let space = config.space()?;
    let viewing = config.viewing()?;
    let session = connect(config).await?;
    let mut orchestrator = MeasurementOrchestrator::from_config(session, config);
    orchestrator.on_measurement(|result| {
        eprintln!("{result}");
        Ok(())
    });

    eprintln!("Press the measure button for each of {} patches.", chart.len());
    let result = orchestrator
        .read_chart(chart, sink, space, viewing, config.measurement.averaging_count)
        .await;
    orchestrator.session_mut().disconnect().await?;
    let count = result?;
    eprintln!("Measured {count} patches.");
    Ok(())
}
