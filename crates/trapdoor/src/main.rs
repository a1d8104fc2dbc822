use std::error::Error;
use std::num::NonZeroUsize;
use std::process;

use clap::{Parser, Subcommand};
use trapdoor_core::arch::x86_64::{GateDescriptor, TrapFrame};
use trapdoor_core::arch::X86_64;
use trapdoor_core::breakpoints::{BreakpointLength, BreakpointManager, BreakpointMode, SLOT_COUNT};
use trapdoor_core::config::{SessionConfig, DEFAULT_IPI_POLL_BUDGET};
use trapdoor_core::halt::{HaltCoordinator, HaltSequence};
use trapdoor_core::patch::vector::{BREAKPOINT_VECTOR, DEBUG_VECTOR};
use trapdoor_core::patch::{ExceptionHooks, HookTarget, VectorTable, HOOK_LENGTH};
use trapdoor_core::platform::sim::{Responder, SimMachine};
use trapdoor_core::platform::DescriptorTable;
use trapdoor_core::registers::RegisterAccess;
use trapdoor_core::session::{DebugEvent, Disposition, EntryReason, ReasonDispatcher};
use trapdoor_core::{Address, CpuId, Session};
use trapdoor_utils::{info, init_logging, init_logging_with_level, LogFormat, LogLevel};

/// Drives the Trapdoor debugger core against a simulated multi-processor machine.
#[derive(Parser, Debug)]
#[command(name = "trapdoor-sim")]
#[command(version)]
#[command(about = "Drives the Trapdoor debugger core against a simulated x86-64 machine", long_about = None)]
struct Cli
{
    /// Number of simulated processors
    #[arg(long, global = true, default_value_t = 4)]
    cpus: u32,
    /// Processors that never answer a halt request (comma separated)
    #[arg(long, global = true, value_delimiter = ',')]
    unresponsive: Vec<u32>,
    /// Processors that ignore the halt IPI and only answer an NMI
    #[arg(long, global = true, value_delimiter = ',')]
    masked: Vec<u32>,
    /// Polls to wait for acknowledgements, per round
    #[arg(long, global = true, default_value_t = DEFAULT_IPI_POLL_BUDGET)]
    poll_budget: u32,
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Log format: pretty or json (overrides TRAPDOOR_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Install a hardware breakpoint on processor 0, show DR7, remove it again
    Breakpoint
    {
        /// Breakpoint slot (0-3)
        #[arg(long, default_value_t = 1)]
        slot: u8,
        /// Linear address to watch (hex with 0x, or decimal)
        #[arg(long, default_value = "0xABCD0000", value_parser = parse_address)]
        address: Address,
        /// execute, write or readwrite
        #[arg(long, default_value = "write", value_parser = parse_mode)]
        mode: BreakpointMode,
        /// Length in bytes: 1, 2, 4 or 8
        #[arg(long, default_value_t = 4)]
        length: u64,
    },
    /// Halt every processor but 0 and report who parked
    Halt,
    /// Dump and read registers of a sample kernel-mode trap frame
    Registers
    {
        /// Dump kind: d (debug), c (control), u (user frame); general if omitted
        #[arg(long)]
        kind: Option<String>,
        /// Register names to read, e.g. sp ss dr7 krsp
        names: Vec<String>,
    },
    /// Run a session whose dispatcher aborts back to the recovery point
    Abort
    {
        /// Reason handed to the abort (non-zero)
        #[arg(default_value_t = 7)]
        reason: usize,
    },
    /// Patch the debug and breakpoint vectors and handlers, then restore them
    Hooks,
}

fn main()
{
    let cli = Cli::parse();

    let logging = match (cli.log_level, cli.log_format) {
        (None, None) => init_logging(),
        (level, format) => init_logging_with_level(level.unwrap_or(LogLevel::Info), format.unwrap_or_default()),
    };
    let _guard = match logging {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(cli: &Cli) -> Result<(), Box<dyn Error>>
{
    info!(cpus = cli.cpus, "simulated machine ready");
    match &cli.command {
        Commands::Breakpoint {
            slot,
            address,
            mode,
            length,
        } => run_breakpoint(cli, *slot, *address, *mode, *length),
        Commands::Halt => run_halt(cli),
        Commands::Registers { kind, names } => run_registers(kind.as_deref(), names),
        Commands::Abort { reason } => run_abort(cli, *reason),
        Commands::Hooks => run_hooks(),
    }
}

fn parse_address(s: &str) -> Result<Address, String>
{
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map(Address::new).map_err(|e| format!("invalid address {s}: {e}"))
}

fn parse_mode(s: &str) -> Result<BreakpointMode, String>
{
    match s.to_lowercase().as_str() {
        "execute" | "exec" | "x" => Ok(BreakpointMode::Execute),
        "write" | "w" => Ok(BreakpointMode::Write),
        "readwrite" | "read-write" | "rw" => Ok(BreakpointMode::ReadWrite),
        _ => Err(format!("Unknown breakpoint mode: {s}. Use 'execute', 'write' or 'readwrite'")),
    }
}

fn session_config(cli: &Cli) -> SessionConfig
{
    SessionConfig::default().poll_budget(cli.poll_budget)
}

/// Apply `--unresponsive` and `--masked` to a fresh machine
fn configure_responders(cli: &Cli, machine: &SimMachine<'_>)
{
    for &cpu in &cli.masked {
        machine.set_responder(CpuId(cpu), Responder::Nmi { after: 0 });
    }
    for &cpu in &cli.unresponsive {
        machine.set_responder(CpuId(cpu), Responder::Never);
    }
}

fn run_breakpoint(cli: &Cli, slot: u8, address: Address, mode: BreakpointMode, length: u64) -> Result<(), Box<dyn Error>>
{
    let length = BreakpointLength::from_bytes(length).ok_or_else(|| format!("invalid breakpoint length {length}"))?;
    let machine = SimMachine::new(cli.cpus);
    let manager = BreakpointManager::new(&machine);
    let cpu = CpuId(0);

    manager.install(cpu, slot, address, mode, length)?;
    println!("installed slot {slot}: {mode} {} bytes at {address}", length.bytes());
    print_slots(&manager, cpu)?;

    manager.remove(cpu, slot)?;
    println!("removed slot {slot}");
    print_slots(&manager, cpu)?;
    Ok(())
}

fn print_slots(manager: &BreakpointManager<'_, SimMachine<'_>>, cpu: CpuId) -> Result<(), Box<dyn Error>>
{
    let status = manager.read_status(cpu)?;
    println!("  dr7 = 0x{:08x}", status.control.bits());
    for slot in 0..SLOT_COUNT {
        let fields = status.slot(slot)?;
        println!(
            "  slot {slot}: address {} mode {} length {} global {} local {}",
            manager.address(cpu, slot)?,
            fields.mode,
            fields.length.bytes(),
            u8::from(fields.global),
            u8::from(fields.local)
        );
    }
    Ok(())
}

fn run_halt(cli: &Cli) -> Result<(), Box<dyn Error>>
{
    let sequence = HaltSequence::new();
    let machine = SimMachine::new(cli.cpus).with_sequence(&sequence);
    configure_responders(cli, &machine);

    let coordinator = HaltCoordinator::new(&sequence, &session_config(cli));
    let report = coordinator.halt_others(&machine);
    println!("{report}");
    for error in report.errors() {
        println!("  {error}");
    }
    coordinator.release(&report);

    let counters = machine.counters();
    println!("ipis sent {}, nmis sent {}", counters.ipis, counters.nmis);
    Ok(())
}

fn sample_frame() -> TrapFrame
{
    TrapFrame {
        ax: 0xffff_8880_0123_4000,
        bx: 0x1,
        cx: 0x2,
        dx: 0x3,
        bp: 0xffff_c900_0000_3f80,
        ip: 0xffff_ffff_8100_2a10,
        cs: 0x10,
        flags: 0x246,
        ..TrapFrame::default()
    }
}

fn run_registers(kind: Option<&str>, names: &[String]) -> Result<(), Box<dyn Error>>
{
    let machine = SimMachine::new(1);
    let frame = sample_frame();
    let registers = RegisterAccess::<X86_64, _>::new(&machine);

    print!("{}", registers.dump(kind, Some(&frame))?);
    for name in names {
        match registers.get(name, Some(&frame)) {
            Ok(value) => println!("{name} = 0x{value:016x}"),
            Err(e) => println!("{name}: {e}"),
        }
    }
    Ok(())
}

/// Dispatcher that gives up on every event
struct Abandon
{
    reason: NonZeroUsize,
}

impl<'s> ReasonDispatcher<X86_64, SimMachine<'s>> for Abandon
{
    fn dispatch(&mut self, event: &mut DebugEvent<'_, X86_64, SimMachine<'s>>) -> Disposition
    {
        println!(
            "dispatching {} on cpu {}, parked [{}]",
            event.reason(),
            event.cpu(),
            event.halt().parked
        );
        event.abort(self.reason)
    }
}

fn run_abort(cli: &Cli, reason: usize) -> Result<(), Box<dyn Error>>
{
    let reason = NonZeroUsize::new(reason).ok_or("abort reason must be non-zero")?;
    let sequence = HaltSequence::new();
    let machine = SimMachine::new(cli.cpus).with_sequence(&sequence);
    configure_responders(cli, &machine);

    let mut session = Session::<X86_64, _, _>::new(&machine, &sequence, session_config(cli), Abandon { reason });
    let mut frame = sample_frame();
    let outcome = session.enter(EntryReason::Oops, Some(&mut frame), 0);

    match outcome.aborted {
        Some(aborted) => println!("session {aborted}"),
        None => println!("session finished without abort"),
    }
    println!("{}", outcome.halt);
    Ok(())
}

fn hex_bytes(bytes: &[u8]) -> String
{
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn run_hooks() -> Result<(), Box<dyn Error>>
{
    let machine = SimMachine::new(1);

    // 32 gates, all pointing at one stub
    let mut gates = vec![
        GateDescriptor {
            offset_low: 0x1000,
            selector: 0x10,
            attributes: 0x8e00,
            offset_mid: 0x8100,
            offset_high: 0xffff_ffff,
            reserved: 0,
        };
        32
    ];
    machine.set_interrupt_table(DescriptorTable {
        limit: u16::try_from(std::mem::size_of_val(gates.as_slice()) - 1)?,
        base: Address::from_ptr(gates.as_mut_ptr()).value(),
    });

    // SAFETY: the table registered above is live for this whole function
    let table = unsafe { VectorTable::<X86_64, _>::new(&machine) };
    for (vector, handler) in [(DEBUG_VECTOR, 0xffff_ffff_c000_0100u64), (BREAKPOINT_VECTOR, 0xffff_ffff_c000_0200)] {
        // SAFETY: simulated machine, nothing takes the vector
        let previous = unsafe { table.hook(vector, Address::new(handler)) }?;
        println!("vector {vector}: {previous} -> {}", table.handler(vector)?);
        // SAFETY: as above
        unsafe { table.unhook(vector, previous) }?;
        println!("vector {vector}: restored {}", table.handler(vector)?);
    }

    // Two fake handlers and two debugger entry points in one text buffer
    let mut text = vec![0x90u8; 256];
    let base = Address::from_ptr(text.as_mut_ptr());
    let debug = HookTarget {
        target: base,
        replacement: base + 0x80,
    };
    let breakpoint = HookTarget {
        target: base + 0x40,
        replacement: base + 0xc0,
    };

    let mut hooks = ExceptionHooks::new();
    // SAFETY: the targets lie inside `text`, which outlives the hooks
    unsafe { hooks.install(&machine, debug, breakpoint) }?;
    println!("debug handler:      {}", hex_bytes(&text[..HOOK_LENGTH]));
    println!("breakpoint handler: {}", hex_bytes(&text[0x40..0x40 + HOOK_LENGTH]));

    // SAFETY: as above
    unsafe { hooks.remove(&machine) }?;
    println!("restored:           {}", hex_bytes(&text[..HOOK_LENGTH]));

    let counters = machine.counters();
    println!("write-protect toggles {}, page aliases {}", counters.write_protect_cleared, counters.maps);
    Ok(())
}
