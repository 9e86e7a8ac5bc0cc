use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use norbm::{Config, Error, Features, NorDevice, SectorUsage};
use norbm_phy::FileNor;

#[derive(Debug, Parser)]
#[command(about = "Inspect and manipulate norbm NOR flash images")]
struct Args {
    /// Image file.
    image: PathBuf,
    /// Physical (erase) sector size of the modelled part.
    #[arg(long, default_value_t = 4096)]
    phy_sector_size: u32,
    /// Logical sector size.
    #[arg(long, default_value_t = 512)]
    log_sector_size: u32,
    /// Protect headers and payloads with CRC.
    #[arg(long)]
    crc: bool,
    /// Protect headers and payloads with ECC.
    #[arg(long)]
    ecc: bool,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create a blank image and low-level format it.
    Format {
        /// Number of physical sectors of the new image.
        #[arg(long, default_value_t = 64)]
        num_sectors: u32,
    },
    /// Print geometry and state.
    Info,
    /// Dump one logical sector as hex.
    Read { sector: u32 },
    /// Write a logical sector with a repeated byte value.
    Write {
        sector: u32,
        #[arg(value_parser = parse_byte)]
        value: u8,
    },
    /// Report whether a logical sector holds data.
    Usage { sector: u32 },
    /// Free a range of logical sectors.
    Free {
        first: u32,
        #[arg(default_value_t = 1)]
        count: u32,
    },
    /// Run maintenance until the image is fully clean.
    Clean,
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let s = s.trim_start_matches("0x");
    u8::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn config(args: &Args) -> Config {
    let mut features = Features::FAIL_SAFE_ERASE | Features::WRITE_VERIFICATION;
    features.set(Features::CRC, args.crc);
    features.set(Features::ECC, args.ecc);
    Config::with_features(features).with_log_sector_size(args.log_sector_size)
}

fn run(args: Args) -> Result<(), Error> {
    let phy = match &args.cmd {
        Command::Format { num_sectors } => {
            FileNor::create(&args.image, *num_sectors, args.phy_sector_size)
        }
        _ => FileNor::open(&args.image, args.phy_sector_size),
    }
    .map_err(|_| Error::Read)?;
    let mut dev = NorDevice::new(phy, config(&args));

    match args.cmd {
        Command::Format { .. } => {
            dev.format_low_level()?;
            println!("formatted {}", args.image.display());
        }
        Command::Info => {
            let info = dev.dev_info()?;
            println!("logical sectors:  {}", info.num_log_sectors);
            println!("sector size:      {}", info.log_sector_size);
            println!("logical blocks:   {}", info.num_log_blocks);
            println!("work blocks:      {}", info.num_work_blocks);
            println!("physical sectors: {}", info.num_phy_sectors);
            println!("erase count max:  {}", info.erase_cnt_max);
            println!("write protected:  {}", info.is_write_protected);
            println!("fatal error:      {}", info.has_fatal_error);
        }
        Command::Read { sector } => {
            let size = dev.dev_info()?.log_sector_size as usize;
            let mut buf = vec![0u8; size];
            dev.read(sector, &mut buf, 1)?;
            for (i, chunk) in buf.chunks(16).enumerate() {
                print!("{:06x}:", i * 16);
                for b in chunk {
                    print!(" {b:02x}");
                }
                println!();
            }
        }
        Command::Write { sector, value } => {
            let size = dev.dev_info()?.log_sector_size as usize;
            dev.write(sector, &vec![value; size], 1, false)?;
            println!("wrote sector {sector}");
        }
        Command::Usage { sector } => {
            let usage = dev.sector_usage(sector)?;
            println!(
                "sector {sector}: {}",
                match usage {
                    SectorUsage::InUse => "in use",
                    SectorUsage::NotUsed => "not used",
                }
            );
        }
        Command::Free { first, count } => {
            dev.free_sectors(first, count)?;
            println!("freed {count} sector(s) from {first}");
        }
        Command::Clean => {
            let bound = dev.clean_cnt()?;
            dev.clean()?;
            println!("clean done ({bound} unit(s) upper bound)");
        }
    }
    dev.unmount()?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Warn
        })
        .init()
        .unwrap();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
