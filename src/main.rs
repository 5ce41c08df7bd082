use std::fs::File;
use std::io::{stdout, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use riscvm::cpu::trap::INTERRUPT_MEXT;
use riscvm::devices::{clint::CLINT_SIZE, Clint, Uart};
use riscvm::{Machine, MachineConfig};

const CLINT_BASE: u64 = 0x0200_0000;
const UART_BASE: u64 = 0x1000_0000;
const UART_SIZE: u64 = 0x1000;

#[derive(Default)]
struct VmArgs {
    bootrom: String,
    dtb: String,
    image: String,
    mem: usize,
    smp: u32,
    rv64: bool,
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level().to_string().to_lowercase(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn mem_suffix_shift(suffix: Option<char>) -> u32 {
    match suffix {
        Some('k') | Some('K') => 10,
        Some('M') => 20,
        Some('G') => 30,
        _ => 0,
    }
}

fn parse_mem(value: &str) -> Option<usize> {
    let shift = mem_suffix_shift(value.chars().last());
    let digits = if shift != 0 {
        &value[..value.len() - 1]
    } else {
        value
    };
    digits.parse::<usize>().ok().map(|n| n << shift)
}

fn print_help() {
    println!();
    println!("riscvm v0.4");
    println!();
    println!("Usage: riscvm [-mem 256M] [-smp 1] [-dtb ...] ... [bootrom]");
    println!();
    println!("    -mem <amount>    Memory amount, default: 256M");
    println!("    -smp <count>     Cores count, default: 1");
    println!("    -rv64            Enable 64-bit RISC-V, 32-bit by default");
    println!("    -dtb <file>      Pass Device Tree Blob to the machine");
    println!("    -image <file>    Attach hard drive with raw image");
    println!("    -verbose         Enable verbose logging");
    println!("    -help            Show this help message");
    println!("    [bootrom]        Machine bootrom (SBI, BBL, etc)");
    println!();
}

/// Consume one argument; supports `-arg val`, `-arg=val`, bare `-arg`
/// and the positional bootrom. Returns (name, value, consumed).
fn get_arg<'a>(argv: &'a [String]) -> (&'a str, &'a str, usize) {
    let arg = argv[0].as_str();
    if let Some(stripped) = arg.strip_prefix('-') {
        let name = stripped.strip_prefix('-').unwrap_or(stripped);
        if let Some(eq) = name.find('=') {
            return (&name[..eq], &name[eq + 1..], 1);
        }
        match argv.get(1) {
            Some(next) if !next.starts_with('-') => (name, next, 2),
            _ => (name, "", 1),
        }
    } else {
        ("bootrom", arg, 1)
    }
}

fn parse_args(argv: &[String], args: &mut VmArgs) -> Result<bool, String> {
    let mut i = 0;
    while i < argv.len() {
        let (name, value, consumed) = get_arg(&argv[i..]);
        i += consumed;
        match name {
            "bootrom" => args.bootrom = value.to_string(),
            "dtb" => args.dtb = value.to_string(),
            "image" => args.image = value.to_string(),
            "mem" => {
                args.mem = parse_mem(value)
                    .ok_or_else(|| format!("invalid memory amount \"{}\"", value))?
            }
            "smp" => {
                args.smp = value
                    .parse()
                    .ok()
                    .filter(|&n| n >= 1 && n <= 1024)
                    .ok_or_else(|| format!("invalid cores count \"{}\"", value))?
            }
            "rv64" => args.rv64 = true,
            "verbose" => log::set_max_level(log::LevelFilter::Info),
            "help" | "h" | "H" => {
                print_help();
                return Ok(false);
            }
            _ => return Err(format!("unknown argument \"{}\"", name)),
        }
    }
    Ok(true)
}

fn load_file_to_ram(machine: &Machine, addr: u64, filename: &str) -> bool {
    let mut file = match File::open(filename) {
        Ok(file) => file,
        Err(err) => {
            log::error!("cannot open file {}: {}", filename, err);
            return false;
        }
    };
    let mut buffer = Vec::new();
    if file.read_to_end(&mut buffer).is_err() {
        log::error!("cannot read file {}", filename);
        return false;
    }
    if !machine.write_ram(addr, &buffer) {
        log::error!("file {} does not fit in RAM", filename);
        return false;
    }
    true
}

// Put stdin into raw, non-blocking mode so guest console input works
// byte-by-byte; ISIG stays on so Ctrl+C still kills the VM
fn set_raw_terminal(enable: bool) {
    use std::mem::MaybeUninit;
    unsafe {
        let fd = libc::STDIN_FILENO;
        let mut raw: libc::termios = MaybeUninit::zeroed().assume_init();
        if libc::tcgetattr(fd, &mut raw) != 0 {
            return;
        }
        if enable {
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;
        } else {
            raw.c_lflag |= libc::ICANON | libc::ECHO;
        }
        libc::tcsetattr(fd, libc::TCSANOW, &raw);
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if enable {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        } else {
            libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
        }
    }
}

fn run_with_args(args: VmArgs) -> i32 {
    let config = MachineConfig {
        mem_size: args.mem,
        smp: args.smp,
        rv64: args.rv64,
        ..MachineConfig::default()
    };
    let mem_base = config.mem_base;
    let mem_size = config.mem_size;

    let mut machine = match Machine::new(config) {
        Ok(machine) => machine,
        Err(err) => {
            log::error!("VM creation failed: {}", err);
            return 1;
        }
    };

    let uart = Arc::new(Uart::new(INTERRUPT_MEXT));
    machine.attach_mmio(UART_BASE, UART_SIZE, uart.clone());
    machine.attach_mmio(CLINT_BASE, CLINT_SIZE, Arc::new(Clint::new(args.smp)));
    let machine = Arc::new(machine);

    if !load_file_to_ram(&machine, mem_base, &args.bootrom) {
        log::error!("failed to load bootrom");
        return 1;
    }

    let mut dtb_addr = None;
    if !args.dtb.is_empty() {
        let addr = mem_base + mem_size as u64 - 0x2000;
        if !load_file_to_ram(&machine, addr, &args.dtb) {
            log::error!("failed to load DTB");
            return 1;
        }
        dtb_addr = Some(addr);
    }

    // Held open for the machine's lifetime; a storage controller model
    // would sit between this and the guest
    let _image = if !args.image.is_empty() {
        match riscvm::blkio::BlkDev::open(&args.image, riscvm::blkio::RVFILE_RW) {
            Ok(dev) => {
                log::info!("attached image {} ({} bytes)", args.image, dev.size());
                Some(dev)
            }
            Err(err) => {
                log::error!("unable to open image: {}", err);
                None
            }
        }
    } else {
        None
    };

    let handles = machine.start(dtb_addr);

    set_raw_terminal(true);
    let mut stdin_buf = [0u8; 64];
    while machine.is_running() {
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                stdin_buf.as_mut_ptr() as *mut libc::c_void,
                stdin_buf.len(),
            )
        };
        if n > 0 {
            for &byte in &stdin_buf[..n as usize] {
                uart.receive(&machine, if byte == b'\r' { b'\n' } else { byte });
            }
        }
        let output = uart.drain_output();
        if !output.is_empty() {
            let _ = stdout().write_all(&output);
            let _ = stdout().flush();
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    set_raw_terminal(false);

    for handle in handles {
        let _ = handle.join();
    }
    0
}

fn main() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(log::LevelFilter::Warn);

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut args = VmArgs {
        smp: 1,
        mem: 256 << 20,
        ..VmArgs::default()
    };

    match parse_args(&argv, &mut args) {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    }

    if args.bootrom.is_empty() {
        println!("Usage: riscvm [-help] [-mem 256M] [-rv64] ... [bootrom]");
        return;
    }

    std::process::exit(run_with_args(args));
}
