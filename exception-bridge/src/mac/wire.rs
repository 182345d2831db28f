//! The Mach message layouts of the exception protocol.
//!
//! The kernel's messages are MIG generated from `exc.defs`/`mach_exc.defs`
//! and laid out with `#pragma pack(4)`, with the code and state arrays only
//! as long as their counts, so rather than mirroring them with structs they
//! are read and written with a cursor.

use super::ffi::*;
use crate::{
    capture::CapturedException,
    kernel::{ExceptionBehavior, Port, PORT_NULL},
    message::{Body, ForwardRequest, Message, Notification, Reply, SetContext},
};
use exception_context::{ExceptionInfo, ExceptionType, RawState, ThreadState, ThreadStateFlavor};
use std::mem::size_of;

/// `exc.defs`, the ids of the requests with 32-bit codes
const EXCEPTION_RAISE: i32 = 2401;
const EXCEPTION_RAISE_STATE_IDENTITY: i32 = 2403;
/// `mach_exc.defs`, the same requests with 64-bit codes
const MACH_EXCEPTION_RAISE: i32 = 2405;
const MACH_EXCEPTION_RAISE_STATE_IDENTITY: i32 = 2407;
/// MIG reply ids are always the request id + 100
const REPLY_OFFSET: i32 = 100;

/// Sent from a hijacked thread to the monitor
const SET_CONTEXT: i32 = 1;
const FORWARD_REQUEST: i32 = 2;

const HEADER_SIZE: usize = 24;
const DESCRIPTOR_SIZE: usize = 12;
const NDR_SIZE: usize = 8;

/// Large enough for any message of the protocol, including a notification
/// carrying the largest possible thread state
pub const WIRE_SIZE: usize = 8 * 1024;

#[repr(C, align(8))]
pub struct WireBuffer(pub [u8; WIRE_SIZE]);

impl WireBuffer {
    #[inline]
    pub fn new() -> Self {
        Self([0; WIRE_SIZE])
    }

    #[inline]
    pub fn header(&mut self) -> *mut msg::mach_msg_header_t {
        self.0.as_mut_ptr().cast()
    }
}

/// Maps a request id to the behavior it was raised with
fn behavior_for(id: i32) -> Option<ExceptionBehavior> {
    let (base, codes64) = match id {
        EXCEPTION_RAISE..=EXCEPTION_RAISE_STATE_IDENTITY => (id - EXCEPTION_RAISE, false),
        MACH_EXCEPTION_RAISE..=MACH_EXCEPTION_RAISE_STATE_IDENTITY => {
            (id - MACH_EXCEPTION_RAISE, true)
        }
        _ => return None,
    };

    let behavior = ExceptionBehavior(base + 1);
    Some(if codes64 {
        behavior.with_64bit_codes()
    } else {
        behavior
    })
}

/// Maps a behavior to the id of the request raised with it
fn request_id(behavior: ExceptionBehavior) -> i32 {
    let first = if behavior.has_64bit_codes() {
        MACH_EXCEPTION_RAISE
    } else {
        EXCEPTION_RAISE
    };

    first + behavior.base().0 - 1
}

struct Writer<'buf> {
    buf: &'buf mut [u8; WIRE_SIZE],
    offset: usize,
}

impl<'buf> Writer<'buf> {
    fn bytes(&mut self, bytes: &[u8]) -> Option<()> {
        let end = self.offset.checked_add(bytes.len())?;
        self.buf.get_mut(self.offset..end)?.copy_from_slice(bytes);
        self.offset = end;
        Some(())
    }

    #[inline]
    fn u32(&mut self, v: u32) -> Option<()> {
        self.bytes(&v.to_ne_bytes())
    }

    #[inline]
    fn i32(&mut self, v: i32) -> Option<()> {
        self.bytes(&v.to_ne_bytes())
    }

    #[inline]
    fn i64(&mut self, v: i64) -> Option<()> {
        self.bytes(&v.to_ne_bytes())
    }

    /// Writes the raw bytes of a plain old data value
    fn pod<T: Copy>(&mut self, v: &T) -> Option<()> {
        // SAFETY: we only write our own repr(C) POD types
        let bytes =
            unsafe { std::slice::from_raw_parts((v as *const T).cast::<u8>(), size_of::<T>()) };
        self.bytes(bytes)
    }

    fn header(&mut self, bits: u32, remote: Port, local: Port, id: i32) -> Option<()> {
        self.u32(bits)?;
        // Filled in once the size is known
        self.u32(0)?;
        self.u32(remote)?;
        self.u32(local)?;
        // voucher
        self.u32(PORT_NULL)?;
        self.i32(id)
    }

    fn port_descriptor(&mut self, name: Port, disposition: u32) -> Option<()> {
        self.u32(name)?;
        // pad1
        self.u32(0)?;
        // pad2
        self.bytes(&[0, 0])?;
        self.bytes(&[disposition as u8, MACH_MSG_PORT_DESCRIPTOR])
    }

    fn ndr(&mut self) -> Option<()> {
        // SAFETY: static provided by libSystem
        let ndr = unsafe { NDR_record };
        self.pod(&ndr)
    }

    fn state(&mut self, state: &RawState) -> Option<()> {
        self.i32(state.flavor.0)?;
        self.u32(state.as_words().len() as u32)?;
        for word in state.as_words() {
            self.u32(*word)?;
        }
        Some(())
    }

    /// Patches the size into the header and returns it
    fn finish(self) -> u32 {
        let size = self.offset as u32;
        self.buf[4..8].copy_from_slice(&size.to_ne_bytes());
        size
    }
}

struct Reader<'buf> {
    buf: &'buf [u8],
    offset: usize,
}

impl<'buf> Reader<'buf> {
    fn bytes(&mut self, len: usize) -> Option<&'buf [u8]> {
        let end = self.offset.checked_add(len)?;
        let bytes = self.buf.get(self.offset..end)?;
        self.offset = end;
        Some(bytes)
    }

    #[inline]
    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_ne_bytes(self.bytes(4)?.try_into().ok()?))
    }

    #[inline]
    fn i32(&mut self) -> Option<i32> {
        Some(i32::from_ne_bytes(self.bytes(4)?.try_into().ok()?))
    }

    #[inline]
    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_ne_bytes(self.bytes(8)?.try_into().ok()?))
    }

    fn pod<T: Copy>(&mut self) -> Option<T> {
        let bytes = self.bytes(size_of::<T>())?;
        // SAFETY: we only read our own repr(C) POD types, which we sent
        // ourselves
        unsafe { Some(std::ptr::read_unaligned(bytes.as_ptr().cast::<T>())) }
    }

    #[inline]
    fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }

    /// Reads the name of a port descriptor
    fn port_descriptor(&mut self) -> Option<Port> {
        let name = self.u32()?;
        self.skip(DESCRIPTOR_SIZE - 4)?;
        Some(name)
    }

    /// Skips the descriptor count and returns the first descriptor's port
    fn single_port_body(&mut self) -> Option<Port> {
        if self.u32()? < 1 {
            return None;
        }
        self.port_descriptor()
    }

    fn state(&mut self) -> Option<RawState> {
        let flavor = ThreadStateFlavor(self.i32()?);
        let count = self.u32()? as usize;
        let bytes = self.bytes(count.checked_mul(4)?)?;

        let mut state = RawState::empty(flavor);
        if count > state.words.len() {
            return None;
        }
        for (word, chunk) in state.words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_ne_bytes(chunk.try_into().ok()?);
        }
        state.count = count as u32;
        Some(state)
    }
}

/// Serializes the message, returning the size of the message that was
/// written, or `None` if it doesn't fit in the buffer
pub fn encode(msg: &Message, buf: &mut WireBuffer) -> Option<u32> {
    let mut w = Writer {
        buf: &mut buf.0,
        offset: 0,
    };

    match &msg.body {
        Body::Notification(n) => {
            let behavior = n.behavior;
            let identity = behavior.carries_identity();

            let bits = msgh_bits(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE)
                | if identity { MACH_MSGH_BITS_COMPLEX } else { 0 };
            w.header(bits, msg.remote_port, msg.local_port, request_id(behavior))?;

            if identity {
                w.u32(2)?;
                w.port_descriptor(n.thread, MACH_MSG_TYPE_COPY_SEND)?;
                w.port_descriptor(n.task, MACH_MSG_TYPE_COPY_SEND)?;
            }

            w.ndr()?;
            w.i32(n.info.kind.0)?;
            let codes = n.info.codes();
            w.u32(codes.len() as u32)?;
            for code in codes {
                if behavior.has_64bit_codes() {
                    w.i64(*code)?;
                } else {
                    w.i32(*code as i32)?;
                }
            }

            if behavior.carries_state() {
                w.state(&n.state)?;
            }
        }
        Body::Reply(r) => {
            w.header(
                msgh_bits(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0),
                msg.remote_port,
                PORT_NULL,
                request_id(r.behavior) + REPLY_OFFSET,
            )?;
            w.ndr()?;
            w.i32(r.ret_code)?;

            if r.behavior.carries_state() {
                w.state(&r.state)?;
            }
        }
        Body::SetContext(sc) => {
            w.header(
                msgh_bits(MACH_MSG_TYPE_COPY_SEND, 0) | MACH_MSGH_BITS_COMPLEX,
                msg.remote_port,
                PORT_NULL,
                SET_CONTEXT,
            )?;
            w.u32(1)?;
            w.port_descriptor(sc.thread, MACH_MSG_TYPE_COPY_SEND)?;
            w.pod(&sc.context)?;
        }
        Body::ForwardRequest(fr) => {
            w.header(
                msgh_bits(MACH_MSG_TYPE_COPY_SEND, 0) | MACH_MSGH_BITS_COMPLEX,
                msg.remote_port,
                PORT_NULL,
                FORWARD_REQUEST,
            )?;
            w.u32(1)?;
            w.port_descriptor(fr.thread, MACH_MSG_TYPE_COPY_SEND)?;
            w.u32(fr.runtime_thread)?;
            w.pod(&fr.exception)?;
        }
        Body::Empty | Body::OwnerDestroyed | Body::Unknown(_) => return None,
    }

    Some(w.finish())
}

fn decode_notification(r: &mut Reader<'_>, behavior: ExceptionBehavior) -> Option<Notification> {
    let (thread, task) = if behavior.carries_identity() {
        if r.u32()? < 2 {
            return None;
        }
        (r.port_descriptor()?, r.port_descriptor()?)
    } else {
        (PORT_NULL, PORT_NULL)
    };

    r.skip(NDR_SIZE)?;
    let kind = ExceptionType(r.i32()?);
    let count = r.u32()? as usize;
    if count > ExceptionInfo::MAX_CODES {
        return None;
    }

    let mut codes = [0i64; ExceptionInfo::MAX_CODES];
    for code in &mut codes[..count] {
        *code = if behavior.has_64bit_codes() {
            r.i64()?
        } else {
            i64::from(r.i32()?)
        };
    }

    let info = ExceptionInfo::new(kind, &codes[..count])?;
    let notification = Notification::new(behavior, thread, task, info);

    if behavior.carries_state() {
        Some(notification.with_state(r.state()?))
    } else {
        Some(notification)
    }
}

fn decode_reply(r: &mut Reader<'_>, behavior: ExceptionBehavior) -> Option<Reply> {
    r.skip(NDR_SIZE)?;
    let ret_code = r.i32()?;

    // Error replies from MIG only have the return code, even for the state
    // behaviors
    let state = if behavior.carries_state() {
        r.state()
            .unwrap_or_else(|| RawState::empty(ThreadStateFlavor::NONE))
    } else {
        RawState::empty(ThreadStateFlavor::NONE)
    };

    Some(Reply {
        behavior,
        ret_code,
        state,
    })
}

fn decode_body(id: i32, r: &mut Reader<'_>) -> Option<Body> {
    if let Some(behavior) = behavior_for(id) {
        return decode_notification(r, behavior).map(Body::Notification);
    }

    if let Some(behavior) = behavior_for(id.wrapping_sub(REPLY_OFFSET)) {
        return decode_reply(r, behavior).map(Body::Reply);
    }

    Some(match id {
        MACH_NOTIFY_SEND_ONCE => Body::OwnerDestroyed,
        SET_CONTEXT => {
            let thread = r.single_port_body()?;
            let context = r.pod::<ThreadState>()?;
            Body::SetContext(SetContext { thread, context })
        }
        FORWARD_REQUEST => {
            let thread = r.single_port_body()?;
            let runtime_thread = r.u32()?;
            let exception = r.pod::<CapturedException>()?;
            Body::ForwardRequest(ForwardRequest {
                thread,
                runtime_thread,
                exception,
            })
        }
        unknown => Body::Unknown(unknown),
    })
}

/// Deserializes a received message. Malformed messages are returned with an
/// [`Body::Unknown`] body.
pub fn decode(buf: &WireBuffer) -> Message {
    let mut r = Reader {
        buf: &buf.0,
        offset: 0,
    };

    let mut parse_header = || -> Option<(u32, Port, Port, i32)> {
        let _bits = r.u32()?;
        let size = r.u32()?;
        let remote = r.u32()?;
        let local = r.u32()?;
        let _voucher = r.u32()?;
        let id = r.i32()?;
        Some((size, remote, local, id))
    };

    let Some((size, remote, local, id)) = parse_header() else {
        return Message::new(PORT_NULL, PORT_NULL, Body::Unknown(0));
    };

    // Never read past what was actually received
    let size = (size as usize).clamp(HEADER_SIZE, WIRE_SIZE);
    let mut r = Reader {
        buf: &buf.0[..size],
        offset: HEADER_SIZE,
    };

    let body = decode_body(id, &mut r).unwrap_or(Body::Unknown(id));
    Message::new(remote, local, body)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::KERN_SUCCESS;
    use exception_context::GeneralRegisters;

    fn round_trip(msg: &Message) -> Message {
        let mut buf = WireBuffer::new();
        let size = encode(msg, &mut buf).unwrap();
        assert_eq!(size as usize % 4, 0);
        decode(&buf)
    }

    #[test]
    fn ids_map_to_behaviors() {
        assert_eq!(behavior_for(2401), Some(ExceptionBehavior::DEFAULT));
        assert_eq!(
            behavior_for(2407),
            Some(ExceptionBehavior::STATE_IDENTITY.with_64bit_codes())
        );
        assert_eq!(behavior_for(2404), None);
        assert_eq!(request_id(ExceptionBehavior::STATE.with_64bit_codes()), 2406);
        assert_eq!(request_id(ExceptionBehavior::DEFAULT), 2401);
    }

    /// A notification shaped like what the kernel sends for a state identity
    /// handler with 64-bit codes
    #[test]
    fn state_identity_notification() {
        let mut general = GeneralRegisters::default();
        general.set_sp(0x7000_0000);

        let info = ExceptionInfo::new(ExceptionType::BAD_ACCESS, &[1, 0x1234_5678_9abc]).unwrap();
        let msg = Message::new(
            0x303,
            0x404,
            Body::Notification(
                Notification::new(
                    ExceptionBehavior::STATE_IDENTITY.with_64bit_codes(),
                    0x505,
                    0x606,
                    info,
                )
                .with_state(RawState::from_registers(&general)),
            ),
        );

        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn exc_codes_are_truncated() {
        let info = ExceptionInfo::new(ExceptionType::ARITHMETIC, &[1, -1]).unwrap();
        let msg = Message::new(
            0x303,
            0x404,
            Body::Notification(Notification::new(ExceptionBehavior::DEFAULT, 0x505, 0x606, info)),
        );

        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn replies_and_requests() {
        let reply = Message::new(
            0x303,
            PORT_NULL,
            Body::Reply(Reply {
                behavior: ExceptionBehavior::DEFAULT.with_64bit_codes(),
                ret_code: KERN_SUCCESS,
                state: RawState::empty(ThreadStateFlavor::NONE),
            }),
        );
        assert_eq!(round_trip(&reply), reply);

        let mut context = ThreadState::zeroed();
        context.set_pc(0x1000);
        let set_context = Message::new(
            0x303,
            PORT_NULL,
            Body::SetContext(SetContext {
                thread: 0x505,
                context,
            }),
        );
        assert_eq!(round_trip(&set_context), set_context);
    }

    #[test]
    fn garbage_is_unknown() {
        let mut buf = WireBuffer::new();
        buf.0[4..8].copy_from_slice(&(HEADER_SIZE as u32).to_ne_bytes());
        buf.0[20..24].copy_from_slice(&2403i32.to_ne_bytes());

        // A state identity notification without a body
        assert_eq!(decode(&buf).body, Body::Unknown(2403));
    }
}
