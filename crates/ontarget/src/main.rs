use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use ontarget_core::config::TargetConfig;
use ontarget_core::symbols::Image;
use ontarget_core::types::Address;
use ontarget_core::{OnTargetError, OnTargetResult};
use ontarget_utils::{info, init_logging};

/// Debugger-mediated on-target testing for embedded firmware.
#[derive(Parser, Debug)]
#[command(name = "ontarget")]
#[command(version)]
#[command(about = "Debugger-mediated on-target testing for embedded firmware", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List the symbols of a firmware ELF
    Symbols
    {
        /// Path to the ELF file
        elf: PathBuf,
        /// Only show symbols whose name contains this substring
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Resolve one symbol to its address and size
    Resolve
    {
        /// Path to the ELF file
        elf: PathBuf,
        /// Symbol name to resolve
        name: String,
    },
    /// Show the memory layout of a type as the compiler emitted it
    Layout
    {
        /// Path to the ELF file
        elf: PathBuf,
        /// Type name (e.g. "my_add_t" or "uint32_t")
        type_name: String,
    },
    /// Show the parameters and return type of a function
    Signature
    {
        /// Path to the ELF file
        elf: PathBuf,
        /// Function name
        function: String,
    },
    /// Map an address back to a function and source location
    Locate
    {
        /// Path to the ELF file
        elf: PathBuf,
        /// Address to look up (hex format: 0x08000100 or decimal)
        address: String,
    },
    /// Parse and validate a target configuration file
    CheckConfig
    {
        /// Path to the TOML configuration file
        path: PathBuf,
    },
}

fn main()
{
    // Initialize logging (reads from RUST_LOG env var)
    // Defaults to INFO level and Pretty format if not set
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> OnTargetResult<()>
{
    match cli.command {
        Commands::Symbols { elf, filter } => {
            info!("Loading symbols from {}", elf.display());
            let image = Image::from_elf(&elf)?;
            let mut symbols: Vec<_> = image
                .symbols()
                .iter()
                .filter(|s| filter.as_deref().is_none_or(|f| s.display_name().contains(f)))
                .collect();
            symbols.sort_by_key(|s| s.address);

            for symbol in &symbols {
                println!(
                    "{}  {:>8}  {:<8}  {}",
                    symbol.address,
                    symbol.size,
                    format!("{:?}", symbol.kind),
                    symbol.display_name()
                );
            }
            println!("\n{} symbols ({} endian)", symbols.len(), image.endianness());
            Ok(())
        }
        Commands::Resolve { elf, name } => {
            let image = Image::from_elf(&elf)?;
            let symbol = image.symbols().resolve(&name)?;

            println!("Symbol: {}", symbol.display_name());
            if symbol.demangled.is_some() {
                println!("  Linkage name: {}", symbol.name);
            }
            println!("  Address: {}", symbol.address);
            println!("  Size: {} bytes", symbol.size);
            println!("  Kind: {:?}", symbol.kind);
            Ok(())
        }
        Commands::Layout { elf, type_name } => {
            let image = Image::from_elf(&elf)?;
            let layout = image.type_layout(&type_name)?;

            println!("{layout}");
            println!("  Size: {} bytes", layout.size());
            println!("  Alignment: {} bytes", layout.alignment());
            Ok(())
        }
        Commands::Signature { elf, function } => {
            let image = Image::from_elf(&elf)?;
            let signature = image.function_signature(&function)?;

            let params = signature
                .params
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(", ");
            let ret = signature.ret.as_ref().map_or_else(|| "void".to_string(), |r| r.name());
            println!("{} {}({})", ret, signature.name, params);
            if let Some(address) = signature.address {
                println!("  Entry: {address}");
            }
            Ok(())
        }
        Commands::Locate { elf, address } => {
            let parsed = parse_address(&address)?;
            let image = Image::from_elf(&elf)?;

            match image.locate(parsed) {
                Some(location) => println!("{parsed} is {location}"),
                None => println!("{parsed} does not fall inside any known symbol"),
            }
            Ok(())
        }
        Commands::CheckConfig { path } => {
            let config = TargetConfig::from_file(&path)?;
            config.validate()?;

            println!("Configuration OK: {}", path.display());
            println!("  Device: {} ({} endian)", config.device_name, config.device_endianness);
            println!("  Monitor: {:?}", config.monitor_type);
            println!("  Application image: {}", config.app_load_elf.display());
            println!("  Symbol source: {}", config.symbol_elf().display());
            if let Some(bl) = &config.bl_load_elf {
                println!("  Bootloader image: {}", bl.display());
            }
            println!("  Memory model: {}", config.on_target_mem_model);
            println!("  Default timeout: {:?}", config.default_timeout());
            Ok(())
        }
    }
}

/// Accepts `0x`-prefixed hex or plain decimal.
fn parse_address(text: &str) -> OnTargetResult<Address>
{
    let cleaned = text.trim();
    let parsed = if let Some(hex) = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        cleaned.parse::<u64>()
    };

    parsed.map(Address::new).map_err(|_| OnTargetError::TypeMismatch {
        context: "address argument".to_string(),
        expected: "a hex (0x...) or decimal address".to_string(),
        found: text.to_string(),
    })
}
