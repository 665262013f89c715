//! BPF-backed trace event source.
//!
//! Bitcoin Core exposes its P2P message tracepoints as SystemTap SDT
//! (USDT) probe points. Attaching to one means reading the probe address
//! out of the target binary's `.note.stapsdt` ELF section and planting a
//! uprobe at the matching file offset. Argument locations are not fixed
//! at an SDT site, so the note's argument spec strings are parsed here
//! and published to the BPF side through the `usdt_specs` map before
//! attachment. Events flow back through a BPF ring buffer.

use anyhow::{anyhow, bail, Context, Result};
use object::{Object, ObjectSection, ObjectSegment};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aya::maps::{Array, RingBuf};
use aya::programs::UProbe;
use aya::{Ebpf, EbpfLoader};

use crate::pid;

use super::{Direction, EventSource, TraceEvent};

/// Compiled BPF object, embedded at build time.
///
/// `include_bytes_aligned!` guarantees the alignment aya's ELF parser
/// needs; plain `include_bytes!` only gives 1-byte alignment.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/net_msg.bpf.o"));

/// Event channel depth. The reader drains in bursts every few seconds, so
/// this has to absorb several seconds of message flow.
const EVENT_CHANNEL_CAPACITY: usize = 8192;

const PROVIDER: &str = "net";
const PROBE_INBOUND: &str = "inbound_message";
const PROBE_OUTBOUND: &str = "outbound_message";

/// Arguments consumed per probe: peer_id, addr, conn_type, msg_type, size.
const NUM_ARGS: usize = 5;

/// Wire format of one ring buffer record (matches `struct p2p_msg` in
/// net_msg.bpf.c).
#[repr(C)]
#[derive(Clone, Copy)]
struct RawP2pMessage {
    peer_id: u64,
    msg_size: u64,
    direction: u8,
    peer_addr: [u8; 68],
    peer_conn_type: [u8; 20],
    msg_type: [u8; 20],
    _pad: [u8; 3],
}

const DIRECTION_INBOUND: u8 = 0;
const DIRECTION_OUTBOUND: u8 = 1;

const USDT_ARG_REG: u32 = 0;
const USDT_ARG_MEM: u32 = 1;
const USDT_ARG_CONST: u32 = 2;

/// One resolved argument location (matches `struct usdt_arg_spec` in
/// net_msg.bpf.c).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct UsdtArgSpec {
    /// Constant value, or displacement for memory args.
    val_off: i64,
    /// Offset of the source register within `struct pt_regs`.
    reg_off: u32,
    /// USDT_ARG_REG, USDT_ARG_MEM or USDT_ARG_CONST.
    kind: u32,
}

// SAFETY: plain C struct, no padding, no invalid bit patterns.
unsafe impl aya::Pod for UsdtArgSpec {}

/// Argument locations for one probe site (matches `struct probe_spec`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct ProbeSpec {
    args: [UsdtArgSpec; NUM_ARGS],
}

// SAFETY: array of Pod structs.
unsafe impl aya::Pod for ProbeSpec {}

/// One probe point read out of `.note.stapsdt`.
struct SdtProbe {
    address: u64,
    args: String,
}

/// USDT-based implementation of [`EventSource`].
pub struct UsdtTracer {
    process_name: String,
    ebpf: Option<Ebpf>,
}

impl UsdtTracer {
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            ebpf: None,
        }
    }
}

impl EventSource for UsdtTracer {
    async fn start(&mut self, cancel: CancellationToken) -> Result<mpsc::Receiver<TraceEvent>> {
        let target_pid = pid::find_unique_pid(&self.process_name)?;
        let exe = pid::exe_path(target_pid)?;
        tracing::info!(pid = target_pid, exe = %exe.display(), "attaching to node process");

        let binary = std::fs::read(&exe)
            .with_context(|| format!("reading target binary {}", exe.display()))?;
        let inbound = find_usdt_probe(&binary, PROVIDER, PROBE_INBOUND)?;
        let outbound = find_usdt_probe(&binary, PROVIDER, PROBE_OUTBOUND)?;
        let inbound_spec = parse_probe_spec(&inbound.args)
            .with_context(|| format!("parsing {PROVIDER}:{PROBE_INBOUND} argument spec"))?;
        let outbound_spec = parse_probe_spec(&outbound.args)
            .with_context(|| format!("parsing {PROVIDER}:{PROBE_OUTBOUND} argument spec"))?;

        let mut ebpf = EbpfLoader::new()
            .load(BPF_OBJ)
            .context("loading BPF objects")?;

        let mut specs: Array<_, ProbeSpec> = Array::try_from(
            ebpf.map_mut("usdt_specs")
                .ok_or_else(|| anyhow!("usdt_specs map not found"))?,
        )?;
        specs.set(0, inbound_spec, 0)?;
        specs.set(1, outbound_spec, 0)?;

        attach_uprobe(&mut ebpf, "net_msg_in", inbound.address, &binary, &exe, target_pid)?;
        attach_uprobe(&mut ebpf, "net_msg_out", outbound.address, &binary, &exe, target_pid)?;

        let events_map = ebpf
            .take_map("events")
            .ok_or_else(|| anyhow!("events map not found"))?;
        let ring_buf = RingBuf::try_from(events_map).context("creating ring buffer")?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(read_loop(ring_buf, tx, cancel));

        // Dropping the Ebpf handle detaches the probes, so it lives as long
        // as the tracer.
        self.ebpf = Some(ebpf);

        tracing::info!("BPF tracer started");
        Ok(rx)
    }
}

fn attach_uprobe(
    ebpf: &mut Ebpf,
    program: &str,
    address: u64,
    binary: &[u8],
    exe: &std::path::Path,
    target_pid: u32,
) -> Result<()> {
    let offset = vaddr_to_file_offset(binary, address)?;
    let prog: &mut UProbe = ebpf
        .program_mut(program)
        .ok_or_else(|| anyhow!("program {program} not found in BPF object"))?
        .try_into()
        .context("program has unexpected type")?;
    prog.load().with_context(|| format!("loading {program}"))?;
    prog.attach(None, offset, exe, Some(target_pid as i32))
        .with_context(|| format!("attaching {program} at offset {offset:#x}"))?;
    Ok(())
}

async fn read_loop(
    ring_buf: RingBuf<aya::maps::MapData>,
    tx: mpsc::Sender<TraceEvent>,
    cancel: CancellationToken,
) {
    let mut async_fd = match AsyncFd::new(ring_buf) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "failed to create async fd for ring buffer");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = async_fd.readable_mut() => {
                let mut guard = match result {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(error = %e, "ring buffer poll error");
                        continue;
                    }
                };

                // Drain all available records.
                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    let data: &[u8] = &item;
                    let Some(event) = parse_record(data) else {
                        tracing::debug!(len = data.len(), "short ring buffer record");
                        continue;
                    };
                    if tx.try_send(event).is_err() {
                        tracing::warn!("event channel full, dropping message");
                    }
                }

                guard.clear_ready();
            }
        }
    }
}

fn parse_record(data: &[u8]) -> Option<TraceEvent> {
    if data.len() < std::mem::size_of::<RawP2pMessage>() {
        return None;
    }
    // Record length was checked; the struct has no invalid bit patterns.
    let raw: RawP2pMessage =
        unsafe { std::ptr::read_unaligned(data.as_ptr() as *const RawP2pMessage) };

    let direction = match raw.direction {
        DIRECTION_INBOUND => Direction::Inbound,
        DIRECTION_OUTBOUND => Direction::Outbound,
        _ => return None,
    };

    Some(TraceEvent {
        peer_id: raw.peer_id,
        peer_addr: cstr_field(&raw.peer_addr),
        peer_conn_type: cstr_field(&raw.peer_conn_type),
        msg_type: cstr_field(&raw.msg_type),
        msg_size: raw.msg_size,
        direction,
    })
}

fn cstr_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Translate a probe's virtual address to its offset within the binary
/// file, which is what a uprobe wants.
fn vaddr_to_file_offset(binary: &[u8], address: u64) -> Result<u64> {
    let obj = object::File::parse(binary).context("parsing target binary")?;
    for segment in obj.segments() {
        let start = segment.address();
        if address >= start && address < start + segment.size() {
            let (file_start, _) = segment.file_range();
            return Ok(address - start + file_start);
        }
    }
    bail!("no load segment contains probe address {address:#x}")
}

/// Find a USDT probe point in an ELF binary's `.note.stapsdt` section.
fn find_usdt_probe(binary: &[u8], provider: &str, probe: &str) -> Result<SdtProbe> {
    let obj = object::File::parse(binary).context("parsing target binary")?;
    let section = obj.section_by_name(".note.stapsdt").ok_or_else(|| {
        anyhow!("target binary has no .note.stapsdt section (built without USDT support?)")
    })?;
    let data = section.data().context("reading .note.stapsdt")?;

    find_probe_note(data, provider, probe)?
        .ok_or_else(|| anyhow!("probe {provider}:{probe} not found in target binary"))
}

/// Walk the SDT note entries looking for `provider:probe`.
///
/// Each entry is a standard ELF note (namesz, descsz, type, "stapsdt"
/// name) whose descriptor holds three u64 addresses followed by the
/// NUL-separated provider, probe name, and argument spec strings. Entries
/// are 4-byte aligned.
fn find_probe_note(data: &[u8], provider: &str, probe: &str) -> Result<Option<SdtProbe>> {
    const SDT_NOTE_TYPE: u32 = 3;
    const SDT_NAME: &[u8] = b"stapsdt\0";

    let mut pos = 0usize;
    while pos + 12 <= data.len() {
        let namesz = read_u32(data, pos)? as usize;
        let descsz = read_u32(data, pos + 4)? as usize;
        let note_type = read_u32(data, pos + 8)?;
        pos += 12;

        let name_end = pos
            .checked_add(namesz)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| anyhow!("malformed SDT note"))?;
        let name = &data[pos..name_end];
        pos = align4(name_end);

        let desc_end = pos
            .checked_add(descsz)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| anyhow!("malformed SDT note"))?;
        let desc = &data[pos..desc_end];
        pos = align4(desc_end);

        if note_type != SDT_NOTE_TYPE || name != SDT_NAME || desc.len() < 24 {
            continue;
        }

        let address = read_u64(desc, 0)?;
        let strings = &desc[24..];
        let mut parts = strings.split(|&b| b == 0);
        let entry_provider = parts.next().unwrap_or_default();
        let entry_probe = parts.next().unwrap_or_default();
        if entry_provider == provider.as_bytes() && entry_probe == probe.as_bytes() {
            let args = parts.next().unwrap_or_default();
            return Ok(Some(SdtProbe {
                address,
                args: String::from_utf8_lossy(args).into_owned(),
            }));
        }
    }
    Ok(None)
}

fn align4(pos: usize) -> usize {
    (pos + 3) & !3
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    let bytes = data
        .get(pos..pos + 4)
        .ok_or_else(|| anyhow!("truncated SDT note"))?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
}

fn read_u64(data: &[u8], pos: usize) -> Result<u64> {
    let bytes = data
        .get(pos..pos + 8)
        .ok_or_else(|| anyhow!("truncated SDT note"))?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
}

/// Parse the first [`NUM_ARGS`] entries of a whitespace-separated SDT
/// argument spec list (e.g. `-8@%rbx 8@-1272(%rbp) 8@%rax`).
fn parse_probe_spec(args: &str) -> Result<ProbeSpec> {
    let mut spec = ProbeSpec::default();
    let mut parsed = 0usize;
    for (slot, arg) in spec.args.iter_mut().zip(args.split_whitespace()) {
        *slot = parse_arg_spec(arg)?;
        parsed += 1;
    }
    if parsed < NUM_ARGS {
        bail!("expected at least {NUM_ARGS} probe arguments, found {parsed}");
    }
    Ok(spec)
}

/// Parse one `size@location` SDT argument spec.
///
/// Supported locations are registers (`%rdi`), register-relative memory
/// (`-1272(%rbp)`, `(%rax)`) and constants (`$5`). That covers what
/// compilers emit for these probe sites on x86-64.
fn parse_arg_spec(arg: &str) -> Result<UsdtArgSpec> {
    let (_size, loc) = arg
        .split_once('@')
        .ok_or_else(|| anyhow!("malformed argument spec {arg:?}"))?;

    if let Some(value) = loc.strip_prefix('$') {
        return Ok(UsdtArgSpec {
            val_off: value
                .parse::<i64>()
                .with_context(|| format!("constant in spec {arg:?}"))?,
            reg_off: 0,
            kind: USDT_ARG_CONST,
        });
    }

    if let Some(reg) = loc.strip_prefix('%') {
        return Ok(UsdtArgSpec {
            val_off: 0,
            reg_off: pt_regs_offset(reg)?,
            kind: USDT_ARG_REG,
        });
    }

    let (disp, rest) = loc
        .split_once('(')
        .ok_or_else(|| anyhow!("malformed argument spec {arg:?}"))?;
    let reg = rest
        .strip_prefix('%')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| anyhow!("malformed argument spec {arg:?}"))?;
    let val_off = if disp.is_empty() {
        0
    } else {
        disp.parse::<i64>()
            .with_context(|| format!("displacement in spec {arg:?}"))?
    };
    Ok(UsdtArgSpec {
        val_off,
        reg_off: pt_regs_offset(reg)?,
        kind: USDT_ARG_MEM,
    })
}

/// Byte offset of a register within the x86-64 `struct pt_regs`, accepting
/// the narrower aliases compilers use in SDT specs.
#[cfg(target_arch = "x86_64")]
fn pt_regs_offset(reg: &str) -> Result<u32> {
    let index: u32 = match reg {
        "r15" | "r15d" | "r15w" | "r15b" => 0,
        "r14" | "r14d" | "r14w" | "r14b" => 1,
        "r13" | "r13d" | "r13w" | "r13b" => 2,
        "r12" | "r12d" | "r12w" | "r12b" => 3,
        "rbp" | "ebp" | "bp" | "bpl" => 4,
        "rbx" | "ebx" | "bx" | "bl" => 5,
        "r11" | "r11d" | "r11w" | "r11b" => 6,
        "r10" | "r10d" | "r10w" | "r10b" => 7,
        "r9" | "r9d" | "r9w" | "r9b" => 8,
        "r8" | "r8d" | "r8w" | "r8b" => 9,
        "rax" | "eax" | "ax" | "al" => 10,
        "rcx" | "ecx" | "cx" | "cl" => 11,
        "rdx" | "edx" | "dx" | "dl" => 12,
        "rsi" | "esi" | "si" | "sil" => 13,
        "rdi" | "edi" | "di" | "dil" => 14,
        "rip" => 16,
        "rsp" | "esp" | "sp" | "spl" => 19,
        other => bail!("unsupported register {other:?} in SDT argument spec"),
    };
    Ok(index * 8)
}

#[cfg(not(target_arch = "x86_64"))]
fn pt_regs_offset(reg: &str) -> Result<u32> {
    bail!("SDT argument parsing is only supported on x86-64 (register {reg:?})")
}
