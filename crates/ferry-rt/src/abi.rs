//! Numeric codes exchanged with the host.
//!
//! Everything that crosses the boundary as a raw integer has a closed enum
//! here, so the trampoline can match exhaustively and the unimplemented
//! combinations stay visible as explicit arms.

use thiserror::Error;

/// A wire value the host sent that has no meaning in this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("unknown event code {0}")]
    UnknownEvent(u32),
    #[error("unknown subtask status {0}")]
    UnknownSubtaskStatus(u32),
    #[error("unknown copy return code {0:#x}")]
    UnknownReturnCode(u32),
    #[error("unknown callback code {0:#x}")]
    UnknownCallbackCode(u32),
}

// ── Callback codes ──────────────────────────────────────────────────

const CALLBACK_EXIT: u32 = 0;
const CALLBACK_YIELD: u32 = 1;
const CALLBACK_WAIT: u32 = 2;
const CALLBACK_POLL: u32 = 3;

/// What the trampoline tells the host to do after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackCode {
    /// The root task is done; no further callbacks.
    Exit,
    /// Call back as soon as possible with `Event::None`.
    Yield,
    /// Block until a waitable in the set has an event.
    Wait(u32),
    /// Check the set without blocking.
    Poll(u32),
}

impl CallbackCode {
    /// Pack into the single integer returned from the export. The set id
    /// occupies the upper 28 bits.
    pub fn encode(self) -> u32 {
        match self {
            CallbackCode::Exit => CALLBACK_EXIT,
            CallbackCode::Yield => CALLBACK_YIELD,
            CallbackCode::Wait(set) => {
                debug_assert!(set < (1 << 28));
                CALLBACK_WAIT | (set << 4)
            }
            CallbackCode::Poll(set) => {
                debug_assert!(set < (1 << 28));
                CALLBACK_POLL | (set << 4)
            }
        }
    }

    pub fn decode(raw: u32) -> Result<Self, AbiError> {
        let set = raw >> 4;
        match raw & 0xf {
            CALLBACK_EXIT if set == 0 => Ok(CallbackCode::Exit),
            CALLBACK_YIELD if set == 0 => Ok(CallbackCode::Yield),
            CALLBACK_WAIT => Ok(CallbackCode::Wait(set)),
            CALLBACK_POLL => Ok(CallbackCode::Poll(set)),
            _ => Err(AbiError::UnknownCallbackCode(raw)),
        }
    }
}

// ── Copy results ────────────────────────────────────────────────────

/// Raw result of a stream/future read or write that did not finish yet.
pub const BLOCKED: u32 = 0xffff_ffff;

const COPY_COMPLETED: u32 = 0x0;
const COPY_DROPPED: u32 = 0x1;
const COPY_CANCELLED: u32 = 0x2;

/// Outcome of a `{stream,future}.{read,write}`. The payload is the number of
/// elements transferred (always zero for futures).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Completed(u32),
    /// The other end was dropped; the count is what moved before that.
    Dropped(u32),
    Cancelled(u32),
}

impl ReturnCode {
    pub fn count(self) -> u32 {
        match self {
            ReturnCode::Completed(n) | ReturnCode::Dropped(n) | ReturnCode::Cancelled(n) => n,
        }
    }

    pub fn encode(self) -> u32 {
        let (count, code) = match self {
            ReturnCode::Completed(n) => (n, COPY_COMPLETED),
            ReturnCode::Dropped(n) => (n, COPY_DROPPED),
            ReturnCode::Cancelled(n) => (n, COPY_CANCELLED),
        };
        debug_assert!(count < (1 << 28));
        (count << 4) | code
    }

    /// Decode a non-blocked copy result. `BLOCKED` is not a return code and
    /// is rejected here; callers check for it first.
    pub fn decode(raw: u32) -> Result<Self, AbiError> {
        if raw == BLOCKED {
            return Err(AbiError::UnknownReturnCode(raw));
        }
        let count = raw >> 4;
        match raw & 0xf {
            COPY_COMPLETED => Ok(ReturnCode::Completed(count)),
            COPY_DROPPED => Ok(ReturnCode::Dropped(count)),
            COPY_CANCELLED => Ok(ReturnCode::Cancelled(count)),
            _ => Err(AbiError::UnknownReturnCode(raw)),
        }
    }
}

// ── Subtasks ────────────────────────────────────────────────────────

/// Progress of an async import call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskStatus {
    Starting,
    Started,
    Returned,
    StartCancelled,
    ReturnCancelled,
}

impl SubtaskStatus {
    pub fn encode(self) -> u32 {
        match self {
            SubtaskStatus::Starting => 0,
            SubtaskStatus::Started => 1,
            SubtaskStatus::Returned => 2,
            SubtaskStatus::StartCancelled => 3,
            SubtaskStatus::ReturnCancelled => 4,
        }
    }

    pub fn decode(raw: u32) -> Result<Self, AbiError> {
        Ok(match raw {
            0 => SubtaskStatus::Starting,
            1 => SubtaskStatus::Started,
            2 => SubtaskStatus::Returned,
            3 => SubtaskStatus::StartCancelled,
            4 => SubtaskStatus::ReturnCancelled,
            _ => return Err(AbiError::UnknownSubtaskStatus(raw)),
        })
    }
}

// ── Events ──────────────────────────────────────────────────────────

const EVENT_NONE: u32 = 0;
const EVENT_SUBTASK: u32 = 1;
const EVENT_STREAM_READ: u32 = 2;
const EVENT_STREAM_WRITE: u32 = 3;
const EVENT_FUTURE_READ: u32 = 4;
const EVENT_FUTURE_WRITE: u32 = 5;
const EVENT_CANCELLED: u32 = 6;

/// One batched event delivered to the `callback` export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    None,
    Subtask { subtask: u32, status: SubtaskStatus },
    StreamRead { end: u32, code: ReturnCode },
    StreamWrite { end: u32, code: ReturnCode },
    FutureRead { end: u32, code: ReturnCode },
    FutureWrite { end: u32, code: ReturnCode },
    Cancelled,
}

impl Event {
    /// Decode the `(event, waitable, payload)` triple the host passes in.
    pub fn decode(event0: u32, event1: u32, event2: u32) -> Result<Self, AbiError> {
        Ok(match event0 {
            EVENT_NONE => Event::None,
            EVENT_SUBTASK => Event::Subtask {
                subtask: event1,
                status: SubtaskStatus::decode(event2)?,
            },
            EVENT_STREAM_READ => Event::StreamRead {
                end: event1,
                code: ReturnCode::decode(event2)?,
            },
            EVENT_STREAM_WRITE => Event::StreamWrite {
                end: event1,
                code: ReturnCode::decode(event2)?,
            },
            EVENT_FUTURE_READ => Event::FutureRead {
                end: event1,
                code: ReturnCode::decode(event2)?,
            },
            EVENT_FUTURE_WRITE => Event::FutureWrite {
                end: event1,
                code: ReturnCode::decode(event2)?,
            },
            EVENT_CANCELLED => Event::Cancelled,
            other => return Err(AbiError::UnknownEvent(other)),
        })
    }

    pub fn encode(self) -> (u32, u32, u32) {
        match self {
            Event::None => (EVENT_NONE, 0, 0),
            Event::Subtask { subtask, status } => (EVENT_SUBTASK, subtask, status.encode()),
            Event::StreamRead { end, code } => (EVENT_STREAM_READ, end, code.encode()),
            Event::StreamWrite { end, code } => (EVENT_STREAM_WRITE, end, code.encode()),
            Event::FutureRead { end, code } => (EVENT_FUTURE_READ, end, code.encode()),
            Event::FutureWrite { end, code } => (EVENT_FUTURE_WRITE, end, code.encode()),
            Event::Cancelled => (EVENT_CANCELLED, 0, 0),
        }
    }

    /// The waitable this event is about, if any.
    pub fn waitable(&self) -> Option<u32> {
        match *self {
            Event::None | Event::Cancelled => None,
            Event::Subtask { subtask, .. } => Some(subtask),
            Event::StreamRead { end, .. }
            | Event::StreamWrite { end, .. }
            | Event::FutureRead { end, .. }
            | Event::FutureWrite { end, .. } => Some(end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_carries_set_in_upper_bits() {
        assert_eq!(CallbackCode::Wait(5).encode(), 2 | (5 << 4));
        assert_eq!(CallbackCode::decode(0x52), Ok(CallbackCode::Wait(5)));
        assert_eq!(CallbackCode::Exit.encode(), 0);
    }

    #[test]
    fn exit_with_set_bits_is_rejected() {
        assert_eq!(
            CallbackCode::decode(0x10),
            Err(AbiError::UnknownCallbackCode(0x10))
        );
    }

    #[test]
    fn return_code_packs_count() {
        assert_eq!(ReturnCode::Dropped(10).encode(), (10 << 4) | 1);
        assert_eq!(ReturnCode::decode(0xa0), Ok(ReturnCode::Completed(10)));
        assert_eq!(ReturnCode::Cancelled(3).count(), 3);
    }

    #[test]
    fn blocked_is_not_a_return_code() {
        assert!(ReturnCode::decode(BLOCKED).is_err());
        assert!(ReturnCode::decode(0x7).is_err());
    }

    #[test]
    fn event_decode_matches_wire_layout() {
        assert_eq!(
            Event::decode(1, 9, 2),
            Ok(Event::Subtask {
                subtask: 9,
                status: SubtaskStatus::Returned
            })
        );
        assert_eq!(
            Event::decode(3, 4, (7 << 4) | 1),
            Ok(Event::StreamWrite {
                end: 4,
                code: ReturnCode::Dropped(7)
            })
        );
        assert_eq!(Event::decode(6, 0, 0), Ok(Event::Cancelled));
        assert_eq!(Event::decode(7, 0, 0), Err(AbiError::UnknownEvent(7)));
        assert_eq!(
            Event::decode(1, 2, 9),
            Err(AbiError::UnknownSubtaskStatus(9))
        );
    }

    #[test]
    fn event_encode_inverts_decode() {
        let event = Event::FutureRead {
            end: 12,
            code: ReturnCode::Completed(0),
        };
        let (a, b, c) = event.encode();
        assert_eq!(Event::decode(a, b, c), Ok(event));
        assert_eq!(event.waitable(), Some(12));
        assert_eq!(Event::None.waitable(), None);
    }
}
