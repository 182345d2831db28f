//! The message envelope.
//!
//! The kernel delivers exceptions in several near identical shapes depending
//! on the behavior the handler was registered with (with or without the
//! thread identity, with or without a thread state), and we exchange a
//! couple of private messages between hijacked threads and the monitor. The
//! [`Message`] normalizes all of them into a single fixed size value, the
//! [`crate::Kernel`] implementation is responsible for the exact wire format.
//!
//! All of the accessors that can only be answered for particular kinds of
//! messages treat being called on the wrong kind as a protocol violation and
//! call [`Kernel::fatal`].

use crate::{
    capture::CapturedException,
    kernel::{ExceptionBehavior, Kernel, Port, ThreadId, KERN_SUCCESS, PORT_NULL},
    registry::ChainBackEntry,
};
use exception_context::{
    ExceptionInfo, ExceptionType, GeneralRegisters, RawState, ThreadState, ThreadStateFlavor,
};

/// An exception raised by the kernel
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Notification {
    /// The behavior the receiving port was registered with, which determines
    /// which of the other fields are present
    pub behavior: ExceptionBehavior,
    /// The faulting thread, [`PORT_NULL`] if the behavior doesn't carry the
    /// identity
    pub thread: ThreadId,
    /// The faulting task, [`PORT_NULL`] if the behavior doesn't carry the
    /// identity
    pub task: Port,
    pub info: ExceptionInfo,
    /// The thread state, empty if the behavior doesn't carry state
    pub state: RawState,
}

impl Notification {
    /// Creates a notification without any embedded state
    pub fn new(behavior: ExceptionBehavior, thread: ThreadId, task: Port, info: ExceptionInfo) -> Self {
        Self {
            behavior,
            thread,
            task,
            info,
            state: RawState::empty(ThreadStateFlavor::NONE),
        }
    }

    #[inline]
    pub fn with_state(mut self, state: RawState) -> Self {
        self.state = state;
        self
    }
}

/// The reply to a [`Notification`]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Reply {
    /// The behavior of the notification this is a reply to
    pub behavior: ExceptionBehavior,
    /// `KERN_SUCCESS` if the exception was handled
    pub ret_code: i32,
    /// The new thread state, only present for behaviors that carry state
    pub state: RawState,
}

/// Sent by a hijacked thread to have the monitor apply a register context to it
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SetContext {
    pub thread: ThreadId,
    pub context: ThreadState,
}

/// Sent by a hijacked thread when the exception was declined, asking the
/// monitor to replay the original exception so it can be forwarded
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ForwardRequest {
    /// The thread to restore
    pub thread: ThreadId,
    /// The thread whose chain-back table the replayed exception is forwarded with
    pub runtime_thread: ThreadId,
    pub exception: CapturedException,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Body {
    Empty,
    Notification(Notification),
    Reply(Reply),
    SetContext(SetContext),
    ForwardRequest(ForwardRequest),
    /// The send-once right we gave to a handler we forwarded to was destroyed
    /// without a reply being sent
    OwnerDestroyed,
    /// A message we don't understand, with its native id
    Unknown(i32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Empty,
    Notification,
    Reply,
    SetContext,
    ForwardRequest,
    OwnerDestroyed,
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Message {
    /// For outgoing messages the destination. For received notifications,
    /// the port the reply needs to be sent to
    pub remote_port: Port,
    /// For received messages, the port it was received on. For outgoing
    /// notifications, the port the reply is expected on
    pub local_port: Port,
    pub body: Body,
}

impl Message {
    #[inline]
    pub fn empty() -> Self {
        Self {
            remote_port: PORT_NULL,
            local_port: PORT_NULL,
            body: Body::Empty,
        }
    }

    #[inline]
    pub fn new(remote_port: Port, local_port: Port, body: Body) -> Self {
        Self {
            remote_port,
            local_port,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::Empty => MessageKind::Empty,
            Body::Notification(_) => MessageKind::Notification,
            Body::Reply(_) => MessageKind::Reply,
            Body::SetContext(_) => MessageKind::SetContext,
            Body::ForwardRequest(_) => MessageKind::ForwardRequest,
            Body::OwnerDestroyed => MessageKind::OwnerDestroyed,
            Body::Unknown(_) => MessageKind::Unknown,
        }
    }

    #[inline]
    pub fn is_set_context_request(&self) -> bool {
        self.kind() == MessageKind::SetContext
    }

    #[inline]
    pub fn is_forward_request(&self) -> bool {
        self.kind() == MessageKind::ForwardRequest
    }

    #[inline]
    pub fn is_notification(&self) -> bool {
        self.kind() == MessageKind::Notification
    }

    #[inline]
    pub fn is_reply(&self) -> bool {
        self.kind() == MessageKind::Reply
    }

    #[inline]
    pub fn is_owner_destroyed_notice(&self) -> bool {
        self.kind() == MessageKind::OwnerDestroyed
    }

    /// Blocks until the next message arrives on the port (set).
    ///
    /// Failing to receive, or receiving a message we don't recognize, is
    /// fatal.
    pub fn receive(&mut self, kernel: &dyn Kernel, port: Port) {
        *self = Self::empty();

        if kernel.receive(port, self).is_err() {
            kernel.fatal("failed to receive an exception message");
        }

        if matches!(self.kind(), MessageKind::Unknown | MessageKind::Empty) {
            kernel.fatal("received an unrecognized exception message");
        }
    }

    /// The notification, fatal if this is any other kind of message
    #[inline]
    pub fn notification(&self, kernel: &dyn Kernel) -> &Notification {
        match &self.body {
            Body::Notification(n) => n,
            _ => kernel.fatal("message is not an exception notification"),
        }
    }

    #[inline]
    pub fn exception_kind(&self, kernel: &dyn Kernel) -> ExceptionType {
        self.notification(kernel).info.kind
    }

    #[inline]
    pub fn subcode_count(&self, kernel: &dyn Kernel) -> usize {
        self.notification(kernel).info.codes().len()
    }

    #[inline]
    pub fn subcode(&self, kernel: &dyn Kernel, i: usize) -> i64 {
        match self.notification(kernel).info.codes().get(i) {
            Some(code) => *code,
            None => kernel.fatal("exception subcode index out of range"),
        }
    }

    /// The thread the message is about.
    ///
    /// Notifications that don't carry the thread identity are matched to a
    /// thread by comparing the stack pointer in the embedded state with the
    /// stack pointer of every live thread, exactly one must match.
    pub fn faulting_thread(&self, kernel: &dyn Kernel) -> ThreadId {
        match &self.body {
            Body::Notification(n) if n.thread != PORT_NULL => n.thread,
            Body::Notification(n) => {
                let Some(general) = n.state.to_registers::<GeneralRegisters>() else {
                    kernel.fatal("notification has neither a thread nor a general thread state");
                };

                let sp = general.sp();
                let mut found = PORT_NULL;
                let mut matches = 0;
                let mut raw = RawState::empty(ThreadStateFlavor::NONE);

                let res = kernel.for_each_thread(&mut |thread| {
                    if kernel
                        .get_thread_state(thread, ThreadStateFlavor::GENERAL, &mut raw)
                        .is_err()
                    {
                        return;
                    }

                    if raw
                        .to_registers::<GeneralRegisters>()
                        .is_some_and(|regs| regs.sp() == sp)
                    {
                        found = thread;
                        matches += 1;
                    }
                });

                if res.is_err() || matches != 1 {
                    kernel.fatal("unable to find the unique thread for a notification");
                }

                found
            }
            Body::SetContext(sc) => sc.thread,
            Body::ForwardRequest(fr) => fr.thread,
            _ => kernel.fatal("message does not refer to a thread"),
        }
    }

    /// Gets the thread state of the specified flavor, from the notification
    /// if it embeds that flavor, otherwise directly from the thread
    pub fn register_state(
        &self,
        kernel: &dyn Kernel,
        flavor: ThreadStateFlavor,
        thread: ThreadId,
        state: &mut RawState,
    ) {
        if let Body::Notification(n) = &self.body {
            if n.state.flavor == flavor && n.state.count > 0 {
                *state = n.state;
                return;
            }
        }

        if kernel.get_thread_state(thread, flavor, state).is_err() {
            kernel.fatal("thread_get_state failed");
        }
    }

    #[inline]
    fn send(&self, kernel: &dyn Kernel) {
        if kernel.send(self).is_err() {
            kernel.fatal("failed to send an exception message");
        }
    }

    /// Asks the monitor listening on the port to apply the context to the thread
    pub fn send_set_context(
        &mut self,
        kernel: &dyn Kernel,
        port: Port,
        thread: ThreadId,
        context: &ThreadState,
    ) {
        self.remote_port = port;
        self.local_port = PORT_NULL;
        self.body = Body::SetContext(SetContext {
            thread,
            context: *context,
        });
        self.send(kernel);
    }

    /// Asks the monitor listening on the port to replay the exception
    pub fn send_forward_request(
        &mut self,
        kernel: &dyn Kernel,
        port: Port,
        thread: ThreadId,
        runtime_thread: ThreadId,
        exception: &CapturedException,
    ) {
        self.remote_port = port;
        self.local_port = PORT_NULL;
        self.body = Body::ForwardRequest(ForwardRequest {
            thread,
            runtime_thread,
            exception: *exception,
        });
        self.send(kernel);
    }

    /// Forwards the notification to a previously registered handler, in the
    /// shape that handler asked for.
    ///
    /// Returns the newly created port, added to `listen_set`, on which the
    /// reply will arrive.
    pub fn forward_notification(
        &mut self,
        kernel: &dyn Kernel,
        handler: &ChainBackEntry,
        source: &Message,
        listen_set: Port,
    ) -> Port {
        let thread = source.faulting_thread(kernel);
        let original = source.notification(kernel);

        let Ok(listen_port) = kernel.create_port(listen_set) else {
            kernel.fatal("failed to allocate a port for a forwarded reply");
        };

        let behavior = handler.behavior;
        let (fthread, task) = if behavior.carries_identity() {
            let task = if original.task != PORT_NULL {
                original.task
            } else {
                kernel.current_task()
            };
            (thread, task)
        } else {
            (PORT_NULL, PORT_NULL)
        };

        self.remote_port = handler.handler;
        self.local_port = listen_port;
        self.body = Body::Notification(Notification::new(behavior, fthread, task, original.info));

        if behavior.carries_state() {
            let mut state = RawState::empty(handler.flavor);
            source.register_state(kernel, handler.flavor, thread, &mut state);

            if let Body::Notification(n) = &mut self.body {
                n.state = state;
            }
        }

        self.send(kernel);
        listen_port
    }

    /// Replies to the notification with the specified result
    pub fn reply_to_notification(&mut self, kernel: &dyn Kernel, source: &Message, ret_code: i32) {
        let original = source.notification(kernel);
        let behavior = original.behavior;

        let mut state = RawState::empty(original.state.flavor);
        if ret_code == KERN_SUCCESS && behavior.carries_state() {
            // The kernel applies the state in the reply, which needs to be the
            // current one in case the thread was hijacked
            let thread = source.faulting_thread(kernel);
            if kernel
                .get_thread_state(thread, original.state.flavor, &mut state)
                .is_err()
            {
                kernel.fatal("thread_get_state failed");
            }
        }

        self.remote_port = source.remote_port;
        self.local_port = PORT_NULL;
        self.body = Body::Reply(Reply {
            behavior,
            ret_code,
            state,
        });
        self.send(kernel);
    }

    /// Translates the reply from a handler we forwarded to into the reply for
    /// the original notification, which may have had a different behavior
    /// or flavor
    pub fn forward_reply(
        &mut self,
        kernel: &dyn Kernel,
        reply_port: Port,
        behavior: ExceptionBehavior,
        thread: ThreadId,
        flavor: ThreadStateFlavor,
        reply: &Message,
    ) {
        let Body::Reply(received) = &reply.body else {
            kernel.fatal("message is not an exception reply");
        };

        let mut state = RawState::empty(flavor);
        if behavior.carries_state() {
            if received.state.flavor == flavor && received.state.count > 0 {
                state = received.state;
            } else if kernel.get_thread_state(thread, flavor, &mut state).is_err() {
                kernel.fatal("thread_get_state failed");
            }
        }

        self.remote_port = reply_port;
        self.local_port = PORT_NULL;
        self.body = Body::Reply(Reply {
            behavior,
            ret_code: received.ret_code,
            state,
        });
        self.send(kernel);
    }

    /// Releases the thread and task rights the message carried
    pub fn release_rights(&self, kernel: &dyn Kernel) {
        match &self.body {
            Body::Notification(n) => {
                if n.thread != PORT_NULL {
                    kernel.release_port(n.thread);
                }
                if n.task != PORT_NULL {
                    kernel.release_port(n.task);
                }
            }
            Body::SetContext(SetContext { thread, .. })
            | Body::ForwardRequest(ForwardRequest { thread, .. }) => {
                kernel.release_port(*thread);
            }
            _ => {}
        }
    }
}
