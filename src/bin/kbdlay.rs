// Kbdlay Replay Tool
// Pushes a scan-code trace through a simulated device stack with the remap core spliced in

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use regex::Regex;

use kbdlay_core::control::wire;
use kbdlay_core::{
    parse_rule_blob, validate_rule_blob, ChainAdapter, ConnectData, ControlRequest,
    ControlSurface, DeviceHandle, DeviceRegistry, DeviceState, DeviceStatus, IdentityResolver,
    IdentityTag, InputConsumer, InternalRequest, KbdLayResult, KeyFlags, LowerDevice,
    RemapEngine, Role, RuleTable, ScanEvent, Settings, Target,
};

const DEFAULT_TAG: &str = "{6b62646c-6179-0000-0000-000000000001}";

/// Replay a scan-code trace through the remap core
#[derive(Parser, Debug)]
#[command(name = "kbdlay")]
#[command(version)]
#[command(about = "Replay keyboard scan codes through a kbdlay rule blob", long_about = None)]
struct Args {
    /// Rule blob file
    #[arg(short, long, value_name = "BLOB")]
    rules: PathBuf,

    /// Trace file (`[e0|e1] <hex code> make|break` per line); stdin if omitted
    #[arg(short, long, value_name = "TRACE")]
    trace: Option<PathBuf>,

    /// Identity tag of the simulated keyboard
    #[arg(long, value_name = "GUID", default_value = DEFAULT_TAG)]
    tag: IdentityTag,

    /// Role applied before replay
    #[arg(long, default_value = "remap")]
    role: Role,

    /// State applied before replay
    #[arg(long, default_value = "active")]
    state: DeviceState,

    /// Settings file (defaults to ~/.config/kbdlay/settings.toml)
    #[arg(short, long, value_name = "SETTINGS")]
    settings: Option<PathBuf>,

    /// Events delivered per batch
    #[arg(long, default_value_t = 8)]
    batch: usize,

    /// Validate the rule blob and exit
    #[arg(long)]
    check_rules: bool,

    /// Print every rule in the blob and exit
    #[arg(long)]
    dump_rules: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Resolver that knows a single tag for every device
struct FixedTag(IdentityTag);

impl IdentityResolver for FixedTag {
    fn resolve(&self, _handle: DeviceHandle) -> Option<IdentityTag> {
        Some(self.0)
    }
}

/// Bottom of the simulated stack: accepts connect/disconnect and pushes
/// trace batches to whoever is connected
#[derive(Default)]
struct PortDevice {
    consumer: Mutex<Option<Arc<dyn InputConsumer>>>,
}

impl PortDevice {
    fn push(&self, events: &[ScanEvent]) -> usize {
        let consumer = self.consumer.lock().clone();
        consumer.map_or(0, |consumer| consumer.deliver(events))
    }
}

impl LowerDevice for PortDevice {
    fn send(&self, request: InternalRequest) -> KbdLayResult<()> {
        match request {
            InternalRequest::Connect(data) => *self.consumer.lock() = Some(data.consumer),
            InternalRequest::Disconnect => *self.consumer.lock() = None,
            InternalRequest::Other { code, .. } => log::debug!("port: request {:#x}", code),
        }
        Ok(())
    }
}

/// Top of the simulated stack: prints what it receives
#[derive(Default)]
struct PrintingConsumer {
    received: AtomicUsize,
}

impl InputConsumer for PrintingConsumer {
    fn deliver(&self, events: &[ScanEvent]) -> usize {
        for event in events {
            println!("  -> {}", event);
        }
        self.received.fetch_add(events.len(), Ordering::Relaxed);
        events.len()
    }
}

/// Reads `[e0|e1] <hex code> make|break` trace lines
struct TraceParser {
    pattern: Regex,
}

impl TraceParser {
    fn new() -> Result<Self> {
        let pattern =
            Regex::new(r"(?i)^(?:(e0|e1)\s+)?(?:0x)?([0-9a-f]{1,4})\s+(make|break|down|up)$")?;
        Ok(Self { pattern })
    }

    /// Parse one trace line; `Ok(None)` for blank lines and comments
    fn parse_line(&self, line: &str) -> Result<Option<ScanEvent>> {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            return Ok(None);
        }

        let caps = self
            .pattern
            .captures(line)
            .with_context(|| format!("unrecognised trace line '{}'", line))?;

        let code = u16::from_str_radix(&caps[2], 16)?;
        let mut event = match caps[3].to_ascii_lowercase().as_str() {
            "make" | "down" => ScanEvent::make(code),
            _ => ScanEvent::brk(code),
        };
        match caps.get(1).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(prefix) if prefix == "e0" => event.flags.set(KeyFlags::E0, true),
            Some(_) => event.flags.set(KeyFlags::E1, true),
            None => {}
        }
        Ok(Some(event))
    }
}

fn read_trace(path: Option<&PathBuf>) -> Result<Vec<ScanEvent>> {
    let reader: Box<dyn BufRead> = match path {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let parser = TraceParser::new()?;
    let mut events = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let parsed = parser
            .parse_line(&line)
            .with_context(|| format!("trace line {}", number + 1))?;
        if let Some(event) = parsed {
            events.push(event);
        }
    }
    Ok(events)
}

fn print_rules(table: &RuleTable) {
    for (key, cell) in table.iter() {
        println!(
            "{:>12} -> {}{:02x}{}",
            key.to_string(),
            if cell.wants_e0() { "e0 " } else { "" },
            cell.out_make_code,
            if cell.wants_shift() { "+shift" } else { "" }
        );
    }
}

fn print_status(status: &DeviceStatus) {
    println!("role:          {}", status.role);
    println!("state:         {}", status.state);
    println!("remap hits:    {}", status.counters.remap_hits);
    println!("pass-throughs: {}", status.counters.pass_throughs);
    println!("unmapped:      {}", status.counters.unmapped);
    println!("shift toggles: {}", status.counters.shift_toggles);
    println!("last error:    {:#010x}", status.last_error);
    match status.tag {
        Some(tag) => println!("tag:           {}", tag),
        None => println!("tag:           (unknown)"),
    }
}

/// Main application state
struct Application {
    args: Args,
    blob: Vec<u8>,
}

impl Application {
    fn new(args: Args) -> Result<Self> {
        let blob = std::fs::read(&args.rules)
            .with_context(|| format!("reading rule blob {}", args.rules.display()))?;
        Ok(Self { args, blob })
    }

    /// Validate the rule blob
    fn check_rules(&self) -> Result<()> {
        let header = validate_rule_blob(&self.blob)
            .with_context(|| format!("{} rejected", self.args.rules.display()))?;
        let table = parse_rule_blob(&self.blob)?;
        println!(
            "{}: version {:#010x}, {} entries, {} distinct rules",
            self.args.rules.display(),
            header.version,
            header.entry_count,
            table.len()
        );
        Ok(())
    }

    fn dump_rules(&self) -> Result<()> {
        let table = parse_rule_blob(&self.blob)
            .with_context(|| format!("{} rejected", self.args.rules.display()))?;
        print_rules(&table);
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings> {
        let settings = match &self.args.settings {
            Some(path) => Settings::from_file(path)
                .with_context(|| format!("loading settings {}", path.display()))?,
            None => Settings::load_default()?,
        };
        Ok(settings)
    }

    fn control(
        &self,
        surface: &ControlSurface,
        request: ControlRequest,
        output_len: usize,
    ) -> Result<Vec<u8>> {
        let (code, input) = wire::encode_request(&request);
        let reply = surface
            .handle_control(code, &input, output_len, None)
            .with_context(|| format!("control request {:#x} failed", code))?;
        Ok(reply)
    }

    fn run(&self) -> Result<()> {
        let config = self.load_settings()?.to_engine_config();
        let tag = self.args.tag;

        let registry = Arc::new(DeviceRegistry::new(config.clone(), Arc::new(FixedTag(tag))));
        let ctx = registry.attach();
        registry.device_started(ctx.handle())?;
        let surface = ControlSurface::new(Arc::clone(&registry));

        let target = Target::Tag(tag);
        self.control(
            &surface,
            ControlRequest::SetRuleBlob {
                target,
                blob: self.blob.clone(),
            },
            0,
        )?;
        self.control(
            &surface,
            ControlRequest::SetRole {
                target,
                role: self.args.role,
            },
            0,
        )?;
        self.control(
            &surface,
            ControlRequest::SetState {
                target,
                state: self.args.state,
            },
            0,
        )?;

        let port = Arc::new(PortDevice::default());
        let printer = Arc::new(PrintingConsumer::default());
        let adapter = ChainAdapter::new(
            Arc::clone(&ctx),
            Arc::new(RemapEngine::new(config)),
            port.clone(),
        );
        adapter.handle(InternalRequest::Connect(ConnectData::new(printer.clone())))?;

        let events = read_trace(self.args.trace.as_ref())?;
        for batch in events.chunks(self.args.batch.max(1)) {
            for event in batch {
                println!("{}", event);
            }
            let consumed = port.push(batch);
            if consumed != batch.len() {
                bail!("adapter consumed {} of {} events", consumed, batch.len());
            }
        }

        adapter.handle(InternalRequest::Disconnect)?;

        let reply = self.control(
            &surface,
            ControlRequest::GetStatus { target },
            wire::status_output_len(),
        )?;
        println!();
        println!(
            "{} input events, {} relayed",
            events.len(),
            printer.received.load(Ordering::Relaxed)
        );
        print_status(&wire::decode_status(&reply)?);
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let app = Application::new(args)?;

    if app.args.check_rules {
        return app.check_rules();
    }
    if app.args.dump_rules {
        return app.dump_rules();
    }

    app.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["kbdlay", "--rules", "/tmp/us-jis.bin"]);
        assert_eq!(args.rules, PathBuf::from("/tmp/us-jis.bin"));
        assert_eq!(args.trace, None);
        assert_eq!(args.role, Role::Remap);
        assert_eq!(args.state, DeviceState::Active);
        assert_eq!(args.batch, 8);
        assert_eq!(args.tag, DEFAULT_TAG.parse().unwrap());
        assert!(!args.check_rules);
    }

    #[test]
    fn test_args_all_flags() {
        let args = Args::parse_from([
            "kbdlay",
            "-r",
            "rules.bin",
            "-t",
            "trace.txt",
            "--tag",
            "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0",
            "--role",
            "base",
            "--state",
            "bypass-soft",
            "--batch",
            "2",
            "--dump-rules",
            "-v",
        ]);
        assert_eq!(args.trace, Some(PathBuf::from("trace.txt")));
        assert_eq!(args.role, Role::Base);
        assert_eq!(args.state, DeviceState::BypassSoft);
        assert_eq!(args.batch, 2);
        assert!(args.dump_rules);
        assert!(args.verbose);
    }

    #[test]
    fn test_args_reject_bad_role() {
        assert!(Args::try_parse_from(["kbdlay", "-r", "x", "--role", "jis"]).is_err());
    }

    #[test]
    fn test_trace_line_parsing() {
        let parser = TraceParser::new().unwrap();
        let parse = |line: &str| parser.parse_line(line);
        assert_eq!(
            parse("10 make").unwrap(),
            Some(ScanEvent::make(0x10))
        );
        assert_eq!(
            parse("  E0 0x1D BREAK  # right ctrl").unwrap(),
            Some(ScanEvent::brk(0x1D).with_e0())
        );
        assert_eq!(
            parse("e1 1d down").unwrap(),
            Some(ScanEvent::make(0x1D).with_e1())
        );
        assert_eq!(parse("# comment only").unwrap(), None);
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_trace_line_rejects_garbage() {
        let parser = TraceParser::new().unwrap();
        let parse = |line: &str| parser.parse_line(line);
        assert!(parse("make 10").is_err());
        assert!(parse("e2 10 make").is_err());
        assert!(parse("12345 make").is_err());
    }

    #[test]
    fn test_port_device_delivers_to_connected_consumer() {
        let port = PortDevice::default();
        assert_eq!(port.push(&[ScanEvent::make(1)]), 0);
        let printer = Arc::new(PrintingConsumer::default());
        port.send(InternalRequest::Connect(ConnectData::new(printer.clone())))
            .unwrap();
        assert_eq!(port.push(&[ScanEvent::make(1), ScanEvent::brk(1)]), 2);
        assert_eq!(printer.received.load(Ordering::Relaxed), 2);
    }
}
