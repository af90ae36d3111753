//! Host function implementations for the `ic0` system API.
//!
//! The set of operations is closed: `HostOp` lists every import a guest may
//! link against, and `HostSurface::add_to_linker` registers exactly that set.
//! Only `trap` aborts an invocation. Everything else degrades softly on bad
//! memory ranges and notes the anomaly in the call log.

use canister_core::{EmulatorConfig, GuestRange, HostSurfaceError, TrapEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use wasmtime::*;

use crate::context::{InvocationContext, Source};
use crate::memory::{decode_text, read_clipped, GuestMemory};
use crate::stable::StableMemory;

/// Import module name of the system API.
pub const IC0: &str = "ic0";

macro_rules! host_ops {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Every operation the host call surface provides.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HostOp {
            $($variant),*
        }

        impl HostOp {
            pub const ALL: &'static [HostOp] = &[$(HostOp::$variant),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(HostOp::$variant => $name),*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(HostOp::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

host_ops! {
    Trap => "trap",
    DebugPrint => "debug_print",
    Time => "time",
    GlobalTimerSet => "global_timer_set",
    PerformanceCounter => "performance_counter",
    MsgArgDataSize => "msg_arg_data_size",
    MsgArgDataCopy => "msg_arg_data_copy",
    MsgCallerSize => "msg_caller_size",
    MsgCallerCopy => "msg_caller_copy",
    MsgMethodNameSize => "msg_method_name_size",
    MsgMethodNameCopy => "msg_method_name_copy",
    AcceptMessage => "accept_message",
    MsgReplyDataAppend => "msg_reply_data_append",
    MsgReply => "msg_reply",
    MsgReplyDataSize => "msg_reply_data_size",
    MsgReplyDataCopy => "msg_reply_data_copy",
    MsgReject => "msg_reject",
    MsgRejectCode => "msg_reject_code",
    MsgRejectMsgSize => "msg_reject_msg_size",
    MsgRejectMsgCopy => "msg_reject_msg_copy",
    MsgCyclesAvailable => "msg_cycles_available",
    MsgCyclesAvailable128 => "msg_cycles_available128",
    MsgCyclesAccept => "msg_cycles_accept",
    MsgCyclesAccept128 => "msg_cycles_accept128",
    MsgCyclesRefunded => "msg_cycles_refunded",
    MsgCyclesRefunded128 => "msg_cycles_refunded128",
    CanisterCycleBalance => "canister_cycle_balance",
    CanisterCycleBalance128 => "canister_cycle_balance128",
    CanisterSelfSize => "canister_self_size",
    CanisterSelfCopy => "canister_self_copy",
    CanisterStatus => "canister_status",
    CanisterVersion => "canister_version",
    IsController => "is_controller",
    InReplicatedExecution => "in_replicated_execution",
    StableSize => "stable_size",
    StableGrow => "stable_grow",
    StableRead => "stable_read",
    StableWrite => "stable_write",
    Stable64Size => "stable64_size",
    Stable64Grow => "stable64_grow",
    Stable64Read => "stable64_read",
    Stable64Write => "stable64_write",
    CallNew => "call_new",
    CallOnCleanup => "call_on_cleanup",
    CallDataAppend => "call_data_append",
    CallCyclesAdd => "call_cycles_add",
    CallCyclesAdd128 => "call_cycles_add128",
    CallPerform => "call_perform",
    CallWithBestEffortResponse => "call_with_best_effort_response",
    CertifiedDataSet => "certified_data_set",
    DataCertificatePresent => "data_certificate_present",
    DataCertificateSize => "data_certificate_size",
    DataCertificateCopy => "data_certificate_copy",
}

/// `(size, copy, source)` triples sharing the same size/copy contract.
const SIZE_COPY_PAIRS: [(HostOp, HostOp, Source); 6] = [
    (HostOp::MsgArgDataSize, HostOp::MsgArgDataCopy, Source::Arguments),
    (HostOp::MsgCallerSize, HostOp::MsgCallerCopy, Source::Caller),
    (HostOp::MsgMethodNameSize, HostOp::MsgMethodNameCopy, Source::MethodName),
    (HostOp::CanisterSelfSize, HostOp::CanisterSelfCopy, Source::CanisterId),
    (HostOp::MsgReplyDataSize, HostOp::MsgReplyDataCopy, Source::Reply),
    (HostOp::MsgRejectMsgSize, HostOp::MsgRejectMsgCopy, Source::RejectMessage),
];

/// Reported by `canister_status`.
const STATUS_RUNNING: i32 = 1;

/// Non-decreasing stand-in for the replica clock and counters.
#[derive(Debug)]
struct StandInClock {
    base_nanos: u64,
    reads: u64,
    counters: BTreeMap<i32, u64>,
    timer: i64,
}

impl StandInClock {
    fn new(base_nanos: u64) -> Self {
        Self {
            base_nanos,
            reads: 0,
            counters: BTreeMap::new(),
            timer: 0,
        }
    }

    fn now(&mut self) -> u64 {
        let now = self.base_nanos.saturating_add(self.reads);
        self.reads += 1;
        now
    }

    fn counter(&mut self, kind: i32) -> u64 {
        let counter = self.counters.entry(kind).or_insert(0);
        let value = *counter;
        *counter += 1;
        value
    }

    fn set_timer(&mut self, deadline: i64) -> i64 {
        std::mem::replace(&mut self.timer, deadline)
    }
}

/// Store data for a loaded canister: the host side of every `ic0` call.
pub struct HostSurface {
    context: Arc<InvocationContext>,
    memory: Option<GuestMemory>,
    clock: StandInClock,
    stable: StableMemory,
}

impl HostSurface {
    pub fn new(context: Arc<InvocationContext>, config: &EmulatorConfig) -> Self {
        Self {
            context,
            memory: None,
            clock: StandInClock::new(config.clock_base_nanos()),
            stable: StableMemory::new(u64::from(config.stable_memory_max_pages)),
        }
    }

    pub fn context(&self) -> &Arc<InvocationContext> {
        &self.context
    }

    pub fn memory(&self) -> Option<GuestMemory> {
        self.memory
    }

    pub fn stable(&self) -> &StableMemory {
        &self.stable
    }

    /// Route all subsequent memory access through `memory`.
    pub fn bind_memory(&mut self, memory: GuestMemory) {
        self.memory = Some(memory);
    }

    /// Add the complete `ic0` import set to a linker
    pub fn add_to_linker(linker: &mut Linker<Self>) -> Result<(), anyhow::Error> {
        // trap: (src: i32, size: i32) -> !
        linker.func_wrap(
            IC0,
            HostOp::Trap.name(),
            |caller: Caller<'_, Self>, src: i32, size: i32| -> anyhow::Result<()> {
                trace(&caller, HostOp::Trap, &[src.into(), size.into()]);
                let message = read_text(&caller, HostOp::Trap, GuestRange::from_i32(src, size))?;
                tracing::debug!("Canister trap: {}", message);
                Err(TrapEvent::new(message).into())
            },
        )?;

        // debug_print: (src: i32, size: i32)
        linker.func_wrap(
            IC0,
            HostOp::DebugPrint.name(),
            |caller: Caller<'_, Self>, src: i32, size: i32| -> anyhow::Result<()> {
                trace(&caller, HostOp::DebugPrint, &[src.into(), size.into()]);
                let line =
                    read_text(&caller, HostOp::DebugPrint, GuestRange::from_i32(src, size))?;
                tracing::info!(target: "canister", "{}", line);
                caller.data().context.push_debug(line);
                Ok(())
            },
        )?;

        linker.func_wrap(IC0, HostOp::Time.name(), |mut caller: Caller<'_, Self>| -> i64 {
            trace(&caller, HostOp::Time, &[]);
            caller.data_mut().clock.now() as i64
        })?;

        linker.func_wrap(
            IC0,
            HostOp::GlobalTimerSet.name(),
            |mut caller: Caller<'_, Self>, deadline: i64| -> i64 {
                trace(&caller, HostOp::GlobalTimerSet, &[deadline]);
                caller.data_mut().clock.set_timer(deadline)
            },
        )?;

        linker.func_wrap(
            IC0,
            HostOp::PerformanceCounter.name(),
            |mut caller: Caller<'_, Self>, kind: i32| -> i64 {
                trace(&caller, HostOp::PerformanceCounter, &[kind.into()]);
                caller.data_mut().clock.counter(kind) as i64
            },
        )?;

        for (size_op, copy_op, source) in SIZE_COPY_PAIRS {
            linker.func_wrap(IC0, size_op.name(), move |caller: Caller<'_, Self>| -> i32 {
                trace(&caller, size_op, &[]);
                caller.data().context.source_len(source) as i32
            })?;

            linker.func_wrap(
                IC0,
                copy_op.name(),
                move |mut caller: Caller<'_, Self>, dst: i32, offset: i32, size: i32| {
                    trace(&caller, copy_op, &[dst.into(), offset.into(), size.into()]);
                    copy_out(&mut caller, copy_op, source, dst, offset, size)
                },
            )?;
        }

        linker.func_wrap(IC0, HostOp::AcceptMessage.name(), |caller: Caller<'_, Self>| {
            trace(&caller, HostOp::AcceptMessage, &[]);
        })?;

        linker.func_wrap(
            IC0,
            HostOp::MsgReplyDataAppend.name(),
            |caller: Caller<'_, Self>, src: i32, size: i32| -> anyhow::Result<()> {
                trace(&caller, HostOp::MsgReplyDataAppend, &[src.into(), size.into()]);
                let bytes = read_guest(
                    &caller,
                    HostOp::MsgReplyDataAppend,
                    GuestRange::from_i32(src, size),
                )?;
                caller.data().context.append_reply(&bytes);
                Ok(())
            },
        )?;

        linker.func_wrap(IC0, HostOp::MsgReply.name(), |caller: Caller<'_, Self>| {
            trace(&caller, HostOp::MsgReply, &[]);
            caller.data().context.finalize_reply();
        })?;

        linker.func_wrap(
            IC0,
            HostOp::MsgReject.name(),
            |caller: Caller<'_, Self>, src: i32, size: i32| -> anyhow::Result<()> {
                trace(&caller, HostOp::MsgReject, &[src.into(), size.into()]);
                let message =
                    read_text(&caller, HostOp::MsgReject, GuestRange::from_i32(src, size))?;
                tracing::warn!("Canister rejected message: {}", message);
                caller.data().context.reject(message);
                Ok(())
            },
        )?;

        linker.func_wrap(IC0, HostOp::MsgRejectCode.name(), |caller: Caller<'_, Self>| -> i32 {
            trace(&caller, HostOp::MsgRejectCode, &[]);
            caller.data().context.reject_code()
        })?;

        linker.func_wrap(IC0, HostOp::StableSize.name(), |caller: Caller<'_, Self>| -> i32 {
            trace(&caller, HostOp::StableSize, &[]);
            caller.data().stable.pages() as i32
        })?;

        linker.func_wrap(
            IC0,
            HostOp::StableGrow.name(),
            |mut caller: Caller<'_, Self>, new_pages: i32| -> i32 {
                trace(&caller, HostOp::StableGrow, &[new_pages.into()]);
                let additional = GuestRange::offset_from_i32(new_pages);
                match caller.data_mut().stable.grow(additional) {
                    Some(old) => old as i32,
                    None => -1,
                }
            },
        )?;

        linker.func_wrap(
            IC0,
            HostOp::StableRead.name(),
            |mut caller: Caller<'_, Self>, dst: i32, offset: i32, size: i32| {
                trace(&caller, HostOp::StableRead, &[dst.into(), offset.into(), size.into()]);
                stable_read(
                    &mut caller,
                    HostOp::StableRead,
                    GuestRange::offset_from_i32(dst),
                    GuestRange::from_i32(offset, size),
                )
            },
        )?;

        linker.func_wrap(
            IC0,
            HostOp::StableWrite.name(),
            |mut caller: Caller<'_, Self>, offset: i32, src: i32, size: i32| {
                trace(&caller, HostOp::StableWrite, &[offset.into(), src.into(), size.into()]);
                stable_write(
                    &mut caller,
                    HostOp::StableWrite,
                    GuestRange::offset_from_i32(offset),
                    GuestRange::from_i32(src, size),
                )
            },
        )?;

        linker.func_wrap(IC0, HostOp::Stable64Size.name(), |caller: Caller<'_, Self>| -> i64 {
            trace(&caller, HostOp::Stable64Size, &[]);
            caller.data().stable.pages() as i64
        })?;

        linker.func_wrap(
            IC0,
            HostOp::Stable64Grow.name(),
            |mut caller: Caller<'_, Self>, new_pages: i64| -> i64 {
                trace(&caller, HostOp::Stable64Grow, &[new_pages]);
                let additional = GuestRange::offset_from_i64(new_pages);
                match caller.data_mut().stable.grow(additional) {
                    Some(old) => old as i64,
                    None => -1,
                }
            },
        )?;

        linker.func_wrap(
            IC0,
            HostOp::Stable64Read.name(),
            |mut caller: Caller<'_, Self>, dst: i64, offset: i64, size: i64| {
                trace(&caller, HostOp::Stable64Read, &[dst, offset, size]);
                stable_read(
                    &mut caller,
                    HostOp::Stable64Read,
                    GuestRange::offset_from_i64(dst),
                    GuestRange::from_i64(offset, size),
                )
            },
        )?;

        linker.func_wrap(
            IC0,
            HostOp::Stable64Write.name(),
            |mut caller: Caller<'_, Self>, offset: i64, src: i64, size: i64| {
                trace(&caller, HostOp::Stable64Write, &[offset, src, size]);
                stable_write(
                    &mut caller,
                    HostOp::Stable64Write,
                    GuestRange::offset_from_i64(offset),
                    GuestRange::from_i64(src, size),
                )
            },
        )?;

        // Cycles, identity, inter-canister calls and certification are
        // accounted nowhere; they answer zero.
        macro_rules! stub {
            ($op:expr, ($($arg:ident : $ty:ty),*) $(=> $ret:expr)?) => {
                linker.func_wrap(IC0, $op.name(), |caller: Caller<'_, Self>, $($arg: $ty),*| {
                    trace(&caller, $op, &[$(i64::from($arg)),*]);
                    $($ret)?
                })?;
            };
        }

        stub!(HostOp::MsgCyclesAvailable, () => 0i64);
        stub!(HostOp::MsgCyclesAccept, (max_amount: i64) => 0i64);
        stub!(HostOp::MsgCyclesRefunded, () => 0i64);
        stub!(HostOp::CanisterCycleBalance, () => 0i64);
        stub!(HostOp::CanisterStatus, () => STATUS_RUNNING);
        stub!(HostOp::CanisterVersion, () => 0i64);
        stub!(HostOp::IsController, (src: i32, size: i32) => 0i32);
        stub!(HostOp::InReplicatedExecution, () => 0i32);
        stub!(
            HostOp::CallNew,
            (
                callee_src: i32,
                callee_size: i32,
                name_src: i32,
                name_size: i32,
                reply_fun: i32,
                reply_env: i32,
                reject_fun: i32,
                reject_env: i32
            )
        );
        stub!(HostOp::CallOnCleanup, (fun: i32, env: i32));
        stub!(HostOp::CallDataAppend, (src: i32, size: i32));
        stub!(HostOp::CallCyclesAdd, (amount: i64));
        stub!(HostOp::CallCyclesAdd128, (amount_high: i64, amount_low: i64));
        stub!(HostOp::CallPerform, () => 0i32);
        stub!(HostOp::CallWithBestEffortResponse, (timeout_seconds: i32));
        stub!(HostOp::CertifiedDataSet, (src: i32, size: i32));
        stub!(HostOp::DataCertificatePresent, () => 0i32);
        stub!(HostOp::DataCertificateSize, () => 0i32);
        stub!(HostOp::DataCertificateCopy, (dst: i32, offset: i32, size: i32));

        // 128-bit cycle amounts are written to guest memory as zero.
        for op in [
            HostOp::MsgCyclesAvailable128,
            HostOp::MsgCyclesRefunded128,
            HostOp::CanisterCycleBalance128,
        ] {
            linker.func_wrap(IC0, op.name(), move |mut caller: Caller<'_, Self>, dst: i32| {
                trace(&caller, op, &[dst.into()]);
                let dst = GuestRange::offset_from_i32(dst);
                write_guest(&mut caller, op, dst, &0u128.to_le_bytes())
            })?;
        }

        linker.func_wrap(
            IC0,
            HostOp::MsgCyclesAccept128.name(),
            |mut caller: Caller<'_, Self>, max_high: i64, max_low: i64, dst: i32| {
                trace(&caller, HostOp::MsgCyclesAccept128, &[max_high, max_low, dst.into()]);
                write_guest(
                    &mut caller,
                    HostOp::MsgCyclesAccept128,
                    GuestRange::offset_from_i32(dst),
                    &0u128.to_le_bytes(),
                )
            },
        )?;

        Ok(())
    }
}

fn trace(caller: &Caller<'_, HostSurface>, op: HostOp, args: &[i64]) {
    tracing::trace!(operation = op.name(), ?args, "ic0 call");
    caller.data().context.record(op.name(), args);
}

fn guest_memory(
    caller: &Caller<'_, HostSurface>,
    op: HostOp,
) -> Result<GuestMemory, HostSurfaceError> {
    caller
        .data()
        .memory
        .ok_or_else(|| HostSurfaceError::new(op.name(), "no linear memory bound"))
}

fn read_guest(
    caller: &Caller<'_, HostSurface>,
    op: HostOp,
    range: GuestRange,
) -> anyhow::Result<Vec<u8>> {
    let memory = guest_memory(caller, op)?;
    let read = memory.read_bytes(caller, range);
    caller.data().context.note(read.fault);
    Ok(read.value)
}

fn read_text(
    caller: &Caller<'_, HostSurface>,
    op: HostOp,
    range: GuestRange,
) -> anyhow::Result<String> {
    read_guest(caller, op, range).map(|bytes| decode_text(&bytes))
}

fn write_guest(
    caller: &mut Caller<'_, HostSurface>,
    op: HostOp,
    offset: u64,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let memory = guest_memory(caller, op)?;
    let write = memory.write_bytes(&mut *caller, offset, bytes);
    caller.data().context.note(write.fault);
    Ok(())
}

/// Copy `stable[range]`, clipped to the current stable size, to `dst`.
fn stable_read(
    caller: &mut Caller<'_, HostSurface>,
    op: HostOp,
    dst: u64,
    range: GuestRange,
) -> anyhow::Result<()> {
    let read = caller.data().stable.read(range);
    caller.data().context.note(read.fault);
    if read.value.is_empty() {
        return Ok(());
    }
    write_guest(caller, op, dst, &read.value)
}

/// Copy guest `src` into stable memory at `offset`.
fn stable_write(
    caller: &mut Caller<'_, HostSurface>,
    op: HostOp,
    offset: u64,
    src: GuestRange,
) -> anyhow::Result<()> {
    let bytes = read_guest(caller, op, src)?;
    let write = caller.data_mut().stable.write(offset, &bytes);
    caller.data().context.note(write.fault);
    Ok(())
}

/// Copy `source[offset..offset + size]`, clipped to what exists, to `dst`.
fn copy_out(
    caller: &mut Caller<'_, HostSurface>,
    op: HostOp,
    source: Source,
    dst: i32,
    offset: i32,
    size: i32,
) -> anyhow::Result<()> {
    let bytes = caller.data().context.source_bytes(source);
    let window = read_clipped(&bytes, GuestRange::from_i32(offset, size)).value;
    if window.is_empty() {
        return Ok(());
    }
    write_guest(caller, op, GuestRange::offset_from_i32(dst), &window)
}
