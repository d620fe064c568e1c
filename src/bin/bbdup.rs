//! Block duplication driver.
//!
//! Decodes one x86-64 basic block given as hex, duplicates it with a
//! demonstration client that counts executions of every copy, prints the
//! result, and optionally traces dispatch or writes an ELF object.
//!
//! ```text
//! bbdup --hex "48 01 d8 c3" --case 1 --case 2 --trace 2 --trace 99
//! ```

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bbdup::core::{
    decode_block, trace_dispatch, CaseEncoding, CleanCall, DupClient, DupContext, DupOptions,
    DupResult, EncodeRegion, Engine, InstrId, InstrList, InstrumentCursor, MachineState,
    ThreadLocalTls, TlsAllocator,
};
use bbdup::x64;
use clap::Parser;
use hashbrown::HashMap;

#[derive(Parser, Debug)]
#[command(name = "bbdup", version, about = "Basic-block duplication driver")]
struct Cli {
    /// Block bytes as hex, whitespace allowed
    #[arg(long)]
    hex: String,
    /// Address the block is decoded at
    #[arg(long, default_value = "0x401000", value_parser = parse_value)]
    pc: usize,
    /// Case encoding to register (repeatable)
    #[arg(long = "case", value_parser = parse_value)]
    cases: Vec<CaseEncoding>,
    /// Default encoding
    #[arg(long, value_parser = parse_value)]
    default: Option<CaseEncoding>,
    /// Maximum number of cases per block
    #[arg(long, default_value_t = 3)]
    limit: u16,
    /// Instrument the block once, without dispatch
    #[arg(long)]
    no_dups: bool,
    /// Constant encoding stored by the encode region
    #[arg(long, value_parser = parse_value)]
    encode: Option<CaseEncoding>,
    /// Trace dispatch with this live encoding (repeatable)
    #[arg(long = "trace", value_parser = parse_value)]
    traces: Vec<CaseEncoding>,
    /// Write an ELF object with one symbol per copy
    #[arg(long)]
    emit_obj: Option<PathBuf>,
    /// Address the instrumented code is assembled at
    #[arg(long, default_value = "0x10000000", value_parser = parse_value)]
    rip: usize,
}

fn parse_value(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid value {s:?}: {e}"))
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|e| format!("invalid byte {byte:?}: {e}"))
        })
        .collect()
}

/// Registers the requested cases and counts entries into every copy.
struct CountingClient {
    default: Option<CaseEncoding>,
    cases: Vec<CaseEncoding>,
    enable: bool,
    encode: Option<CaseEncoding>,
    hits: Arc<Mutex<HashMap<CaseEncoding, usize>>>,
}

impl DupClient for CountingClient {
    type OrigAnalysis = usize;
    type CaseAnalysis = ();

    fn set_up_bb_dups(&mut self, ctx: &mut DupContext<'_>, _tag: u64, _bb: &InstrList) -> DupResult<()> {
        if let Some(default) = self.default {
            ctx.set_default_encoding(default)?;
        }
        if !self.enable {
            ctx.set_enable_dups(false);
            return Ok(());
        }
        for &case in &self.cases {
            // Rejections are logged by the registry; keep what fits.
            let _ = ctx.register_case_encoding(case);
        }
        Ok(())
    }

    fn analyze_orig(&mut self, _tag: u64, bb: &InstrList) -> Option<usize> {
        Some(bb.app_ids().len())
    }

    fn insert_encode(&mut self, region: &mut EncodeRegion<'_>, _tag: u64, _orig: Option<&usize>) -> DupResult<()> {
        let Some(value) = self.encode else {
            return Ok(());
        };
        if region.store_encoding(value).is_err() {
            region.insert_clean_call(CleanCall::new("set_encoding", move |ctx| ctx.set_encoding(value)));
        }
        Ok(())
    }

    fn instrument_instr(
        &mut self,
        cursor: &mut InstrumentCursor<'_>,
        instr: InstrId,
        orig: Option<&usize>,
        _case: Option<&()>,
    ) -> DupResult<()> {
        if !cursor.is_first_instr(instr)? {
            return Ok(());
        }
        let encoding = cursor.encoding();
        let hits = Arc::clone(&self.hits);
        let call = CleanCall::new(format!("count_{encoding:x}"), move |_ctx| {
            if let Ok(mut hits) = hits.lock() {
                *hits.entry(encoding).or_insert(0) += 1;
            }
        });
        cursor.insert_clean_call_before(instr, call)?;
        log::debug!("copy {:#x}: counting entries over {} instructions", encoding, orig.copied().unwrap_or(0));
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let bytes = parse_hex(&cli.hex)?;
    let pc = cli.pc as u64;
    let bb = decode_block(&bytes, pc)?;

    let hits = Arc::new(Mutex::new(HashMap::new()));
    let client = CountingClient {
        default: cli.default,
        cases: cli.cases.clone(),
        enable: !cli.no_dups,
        encode: cli.encode,
        hits: Arc::clone(&hits),
    };
    let tls = Arc::new(ThreadLocalTls::new());
    let host: Arc<dyn TlsAllocator> = tls.clone();
    let options = DupOptions::default().with_dup_limit(cli.limit);
    let mut engine = Engine::init(host, options, client)?;

    let block = engine.instrument_block(pc, bb)?;
    print!("{block}");

    for &value in &cli.traces {
        engine.slot().set(&*tls, value);
        let trace = trace_dispatch(&block, engine.slot(), &*tls, MachineState::new(0, 0))?;
        let copy = &block.copies()[trace.copy];
        let kind = if copy.is_default { "default" } else { "case" };
        println!(
            "live {:#x} -> copy {} ({} {:#x}), {} steps, calls {:?}",
            value, trace.copy, kind, copy.encoding, trace.steps, trace.clean_calls
        );
    }
    if !cli.traces.is_empty() {
        if let Ok(hits) = hits.lock() {
            let mut counts: Vec<_> = hits.iter().collect();
            counts.sort();
            println!("entries: {counts:?}");
        }
    }

    if let Some(path) = &cli.emit_obj {
        // Helpers have no real address outside a host; give each a stub slot.
        let mut stubs: HashMap<String, u64> = HashMap::new();
        let stub_base = 0x7000_0000u64;
        let assembled = x64::assemble(&block, cli.rip as u64, |call| {
            let next = stub_base + stubs.len() as u64 * 0x10;
            Some(*stubs.entry(call.name().to_string()).or_insert(next))
        })?;
        let object = x64::write_object(&assembled)?;
        fs::write(path, object)?;
        println!("wrote {} ({} bytes of code)", path.display(), assembled.code.len());
    }

    eprint!("{}", engine.stats());
    engine.exit()?;
    Ok(())
}
