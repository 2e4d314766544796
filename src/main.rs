#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use eebl0_loader::{Fault, Image, Options, Session, PAGE_COUNT};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    #[structopt(flatten)]
    options: Options,

    #[structopt(subcommand)]
    command: Operation,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Erase the application flash
    Erase,

    /// Verify the device flash against a firmware binary
    Verify {
        /// Firmware binary
        file: String,
    },

    /// Program a firmware binary to the device
    Program {
        /// Firmware binary
        file: String,

        /// Erase the device before programming
        #[structopt(long)]
        erase: bool,

        /// Skip verification after programming
        #[structopt(long)]
        no_verify: bool,
    },

    /// Read the device flash
    Read {
        /// File to write the flash contents to
        #[structopt(long)]
        output: Option<String>,

        /// Print the flash contents as hex
        #[structopt(long)]
        hex: bool,
    },

    /// Start the application
    Run,

    /// Connect and report the session status
    Status,
}

fn progress(label: &str) -> ProgressBar {
    let pb = ProgressBar::new(PAGE_COUNT as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>10} [{bar:40}] {pos}/{len} pages")
            .progress_chars("=> "),
    );
    pb.set_message(label);
    pb
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("{} loader, port: {}", eebl0_loader::welcome(), o.port);

    let mut s = Session::linux(&o.port, o.options.clone())?
        .with_sink(|f: Fault| debug!("Fault {:?} (code {})", f, f.code()));

    if let Err(e) = s.connect() {
        error!("Error connecting to bootloader: {}", e);
        return Err(e).context(format!("session status: {}", s.status()));
    }

    info!("Bootloader connected!");

    match &o.command {
        Operation::Erase => {
            if !s.erase()? {
                return Err(anyhow!("Erase not acknowledged"));
            }
            info!("Erase complete");
        }
        Operation::Verify { file } => {
            let image = s.load_firmware(file)?;
            info!("Firmware: {}", bytefmt::format(image.source_len() as u64));

            let pb = progress("verify");
            let ok = s.verify_with(|_| pb.inc(1))?;
            pb.finish();

            if !ok {
                return Err(anyhow!("Verification failed"));
            }
            info!("Verification passed");
        }
        Operation::Program {
            file,
            erase,
            no_verify,
        } => {
            let image = s.load_firmware(file)?;
            info!("Firmware: {}", bytefmt::format(image.source_len() as u64));

            if *erase && !s.erase()? {
                return Err(anyhow!("Erase not acknowledged"));
            }

            let pb = progress("program");
            let ok = s.program_with(|_| pb.inc(1))?;
            pb.finish();

            if !ok {
                return Err(anyhow!("Programming failed"));
            }

            if !*no_verify {
                let pb = progress("verify");
                let ok = s.verify_with(|_| pb.inc(1))?;
                pb.finish();

                if !ok {
                    return Err(anyhow!("Verification failed"));
                }
            }
            info!("Programming complete");
        }
        Operation::Read { output, hex } => {
            let pb = progress("read");
            let image = s.read_with(|_| pb.inc(1))?;
            pb.finish();

            let image: Image = image.ok_or_else(|| anyhow!("Read rejected by bootloader"))?;

            if let Some(path) = output {
                std::fs::write(path, image.as_bytes())
                    .with_context(|| format!("writing flash contents to '{}'", path))?;
                info!(
                    "Wrote {} to '{}'",
                    bytefmt::format(image.as_bytes().len() as u64),
                    path
                );
            }

            if *hex {
                for (i, page) in image.pages().enumerate() {
                    println!("{:04x}: {}", i * page.len(), hex::encode(page));
                }
            }
        }
        Operation::Run => {
            if !s.run_app()? {
                return Err(anyhow!("Run not acknowledged"));
            }
            info!("Application started");
        }
        Operation::Status => (),
    }

    info!("Status: {}", s.status());

    s.disconnect();
    s.free();

    Ok(())
}
