use clap::Parser;
use ds1wm::Ds1wmBuilder;
use linux_embedded_hal::Delay;
use onewire_bus::{ResetOutcome, SearchKind};
use owfs_bus::{
    AdapterKind, BusError, BusOptions, BusRegistry, Connection, Flatten, UsbDirectory,
    UsbMonitor, browse_w1, spawn_registrar, spawn_w1_registrar,
};
use std::{
    error::Error,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::Duration,
};
use w1_netlink::Dispatcher;

mod mmap;
mod netlink;
mod usb;

/// Lists the devices on 1-Wire bus masters
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Use the N-th DS9490 USB adapter (from 1)
    #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "1")]
    usb: Option<usize>,
    /// Also register DS9490 adapters found while running
    #[arg(long)]
    usb_scan: bool,
    /// DS1WM register block at a physical address (e.g., 0x80000000)
    #[arg(long, value_name = "ADDR", value_parser = parse_address)]
    ds1wm: Option<u64>,
    /// Input clock of the DS1WM in Hz
    #[arg(long, default_value_t = 10_000_000)]
    ds1wm_frequency: u32,
    /// K1WM register block at an offset in the UIO mapping, with its channel count
    #[arg(long, value_name = "ADDR[,CHANNELS]", value_parser = parse_k1wm)]
    k1wm: Option<(u64, u8)>,
    /// UIO device of the K1WM
    #[arg(long, default_value = "/dev/uio0")]
    uio: PathBuf,
    /// Use the bus masters of the kernel w1 subsystem
    #[arg(long)]
    w1: bool,
    /// Where the kernel lists w1 bus masters when netlink is unavailable
    #[arg(long, default_value = "/sys/bus/w1/devices")]
    w1_sysfs: PathBuf,
    /// List only devices reporting an alarm
    #[arg(long)]
    alarm: bool,
    /// Timeout of USB transfers and w1 requests, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn parse_address(s: &str) -> Result<u64, String> {
    let address = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("{s}: {e}"))?;
    if address == 0 {
        return Err("illegal address 0".into());
    }
    Ok(address)
}

fn parse_k1wm(s: &str) -> Result<(u64, u8), String> {
    let (address, channels) = match s.split_once(',') {
        Some((address, channels)) => (
            address,
            channels.parse().map_err(|e| format!("{channels}: {e}"))?,
        ),
        None => (s, 1),
    };
    Ok((parse_address(address)?, channels))
}

fn add_memory_mapped(args: &Args, options: &BusOptions, registry: &BusRegistry) -> Result<(), Box<dyn Error>> {
    if let Some(address) = args.ds1wm {
        let (map, within) = mmap::Mapping::physical(address)?;
        let regs = mmap::MappedRegisters::new(map, within)?;
        let ds1wm = Ds1wmBuilder::default()
            .with_frequency(args.ds1wm_frequency)
            .build(regs, Delay)
            .map_err(BusError::from)?;
        let adapter = Flatten::boxed(AdapterKind::MemoryMapped, ds1wm);
        registry.add(Connection::new(
            format!("DS1WM at {address:#x}"),
            adapter,
            options.clone(),
        ));
    }
    if let Some((offset, channels)) = args.k1wm {
        let (map, within) = mmap::Mapping::uio(&args.uio)?;
        let chip = Arc::new(Mutex::new(()));
        let offset = usize::try_from(offset)? + within;
        for channel in 0..channels {
            let regs = mmap::MappedRegisters::new(map.clone(), offset)?;
            let k1wm = Ds1wmBuilder::default()
                .with_channel(channel)
                .build(regs, Delay)
                .map_err(BusError::from)?;
            let adapter = Flatten::boxed(AdapterKind::MemoryMapped, k1wm);
            let conn = Connection::new(format!("K1WM channel {channel}"), adapter, options.clone())
                .with_chip_lock(chip.clone());
            registry.add(conn);
        }
    }
    Ok(())
}

fn list(registry: &BusRegistry, kind: SearchKind) {
    for (id, conn) in registry.connections() {
        match conn.reset() {
            Ok(ResetOutcome::Ok) => {}
            Ok(outcome) => {
                log::warn!("bus.{id} ({}): reset {outcome:?}", conn.name());
                continue;
            }
            Err(e) => {
                log::warn!("bus.{id} ({}): {e}", conn.name());
                continue;
            }
        }
        match conn.devices(kind) {
            Ok(roms) => {
                println!("bus.{id} {} ({} devices)", conn.name(), roms.len());
                for rom in roms {
                    println!("  {rom}");
                }
            }
            Err(e) => log::warn!("bus.{id} ({}): search failed: {e}", conn.name()),
        }
        log::debug!("bus.{id} stats: {:?}", conn.stats().snapshot());
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let timeout = Duration::from_millis(args.timeout_ms);
    let options = BusOptions::default()
        .with_usb_timeout(timeout)
        .with_w1_timeout(timeout);
    let registry = Arc::new(BusRegistry::new());
    let (commands, requests) = mpsc::channel();
    let registrar = spawn_registrar(registry.clone(), requests)?;

    let mut monitor = None;
    if args.usb.is_some() || args.usb_scan {
        let directory = UsbDirectory::new(usb::RusbScanner::new(options.clone()));
        if let Some(n) = args.usb {
            let claim = directory.claim_nth(n.saturating_sub(1))?;
            let (id, conn) = registry.add(Connection::usb(claim, directory.clone(), options.clone()));
            log::info!("bus.{id} is {}", conn.name());
        }
        if args.usb_scan {
            monitor = Some(UsbMonitor::spawn(directory, commands.clone(), options.clone())?);
        }
    }
    add_memory_mapped(&args, &options, &registry)?;
    if args.w1 {
        let socket = netlink::ConnectorSocket::bind()?;
        let (dispatcher, control, _reader) = Dispatcher::spawn(socket)?;
        spawn_w1_registrar(dispatcher.clone(), control, commands.clone(), options.clone())?;
        browse_w1(&dispatcher, &args.w1_sysfs, &commands, &options)?;
    }
    if args.w1 || monitor.is_some() {
        // Kernel masters and hot-plugged adapters are registered asynchronously.
        thread::sleep(options.w1_timeout());
    }

    let kind = if args.alarm {
        SearchKind::Alarmed
    } else {
        SearchKind::Normal
    };
    list(&registry, kind);

    if let Some(monitor) = monitor {
        monitor.stop();
    }
    registry.close_all();
    drop(commands);
    if !args.w1 && registrar.join().is_err() {
        log::warn!("bus registrar panicked");
    }
    Ok(())
}

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();
    // Parse command line arguments
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("owfs-linux: {e}");
            ExitCode::FAILURE
        }
    }
}
