//! The monitor thread's dispatch loop.
//!
//! Everything in here runs on a thread that is never registered for
//! exceptions, so that a fault in the loop can't deadlock waiting for the
//! loop. It must not allocate, log, or take locks that a faulting thread may
//! hold; unrecoverable conditions go through [`Kernel::fatal`].

use crate::{
    capture::CapturedException,
    config::Config,
    debug_print,
    dispatch::Dispatcher,
    forward::{ForwardedException, ForwardedExceptions, PendingReplay, PendingReply},
    hijack,
    kernel::{Kernel, Port, ThreadId, KERN_FAILURE, KERN_SUCCESS},
    message::{Body, Message, MessageKind},
    ownership::Ownership,
    registry::RegistryIndex,
};
use std::sync::Arc;

pub struct Monitor {
    kernel: Arc<dyn Kernel>,
    /// The set containing the exception port and every port we are waiting
    /// for a forwarded reply on
    port_set: Port,
    exception_port: Port,
    registry: Arc<RegistryIndex>,
    ownership: Arc<Ownership>,
    dispatcher: Arc<Dispatcher>,
    config: Config,
    forwards: ForwardedExceptions,
    /// The message being handled
    message: Box<Message>,
    /// The message being sent in response
    scratch: Box<Message>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kernel: Arc<dyn Kernel>,
        port_set: Port,
        exception_port: Port,
        registry: Arc<RegistryIndex>,
        ownership: Arc<Ownership>,
        dispatcher: Arc<Dispatcher>,
        config: Config,
    ) -> Self {
        Self {
            kernel,
            port_set,
            exception_port,
            registry,
            ownership,
            dispatcher,
            config,
            forwards: ForwardedExceptions::new(),
            message: Box::new(Message::empty()),
            scratch: Box::new(Message::empty()),
        }
    }

    /// Handles messages until the process exits
    pub fn run(mut self) -> ! {
        loop {
            self.step();
        }
    }

    /// The port exceptions are delivered to
    #[inline]
    pub fn exception_port(&self) -> Port {
        self.exception_port
    }

    /// The number of exceptions that have been forwarded or declined and
    /// are still waiting for a reply or a replay
    #[inline]
    pub fn outstanding_forwards(&self) -> usize {
        self.forwards.len()
    }

    #[inline]
    pub fn forwards(&self) -> &ForwardedExceptions {
        &self.forwards
    }

    /// Receives and handles a single message
    pub fn step(&mut self) {
        self.message.receive(&*self.kernel, self.port_set);

        // Replies are matched before the sweep, the handler we forwarded to
        // may have terminated the thread before replying
        let kind = self.message.kind();
        let pending = match kind {
            MessageKind::Reply | MessageKind::OwnerDestroyed => {
                self.forwards.take_reply(self.message.local_port)
            }
            _ => None,
        };

        self.sweep();

        match kind {
            MessageKind::SetContext => {
                debug_print!("received set context request");
                self.handle_set_context();
            }
            MessageKind::Notification => {
                debug_print!("received exception notification");
                self.handle_notification();
            }
            MessageKind::ForwardRequest => {
                debug_print!("received forward request");
                self.handle_forward_request();
            }
            MessageKind::Reply => {
                debug_print!("received forwarded reply");
                self.handle_reply(pending);
            }
            MessageKind::OwnerDestroyed => {
                debug_print!("received send-once notification");
                self.handle_owner_destroyed(pending);
            }
            MessageKind::Empty | MessageKind::Unknown => {
                self.kernel.fatal("received an unrecognized exception message");
            }
        }

        self.message.release_rights(&*self.kernel);
    }

    /// Discards the records of threads that exited while we were waiting on
    /// them
    fn sweep(&mut self) {
        if self.forwards.is_empty() {
            return;
        }

        let kernel = &*self.kernel;
        self.forwards.sweep(
            |thread| kernel.is_thread_alive(thread),
            |fe| {
                if let ForwardedException::Reply(pr) = fe {
                    debug_print!("discarding forwarded exception for exited thread");
                    destroy_right(kernel, pr.listen_port);
                    destroy_right(kernel, pr.reply_to);
                }
            },
        );
    }

    fn handle_set_context(&mut self) {
        let kernel = &*self.kernel;
        let Body::SetContext(sc) = &self.message.body else {
            kernel.fatal("message is not a set context request");
        };

        if kernel.suspend_thread(sc.thread).is_err() {
            kernel.fatal("failed to suspend thread");
        }

        if crate::capture::set_thread_context(kernel, sc.thread, &sc.context).is_err() {
            kernel.fatal("failed to set thread context");
        }

        if kernel.resume_thread(sc.thread).is_err() {
            kernel.fatal("failed to resume thread");
        }
    }

    fn handle_notification(&mut self) {
        let kernel = &*self.kernel;
        let thread = self.message.faulting_thread(kernel);
        let kind = self.message.exception_kind(kernel);

        // This is the second delivery of an exception our handler declined,
        // it goes straight to whoever was registered before us
        if let Some(runtime_thread) = self.forwards.take_replay(thread, kind) {
            self.chain_back(thread, runtime_thread);
            return;
        }

        let exception = CapturedException::capture(kernel, &self.message, thread);

        if self.ownership.is_owned(kernel, &exception.state) {
            hijack::hijack_thread(kernel, &self.dispatcher, &self.config, thread, &exception);
            self.scratch
                .reply_to_notification(kernel, &self.message, KERN_SUCCESS);
        } else {
            self.chain_back(thread, thread);
        }
    }

    /// Forwards the notification to the handler that was registered for the
    /// exception before us, or fails it if there isn't one
    fn chain_back(&mut self, thread: ThreadId, runtime_thread: ThreadId) {
        let kernel = &*self.kernel;
        let kind = self.message.exception_kind(kernel);

        let Some(handler) = self.registry.lookup(kernel, runtime_thread, kind) else {
            debug_print!("no chain-back handler");
            self.scratch
                .reply_to_notification(kernel, &self.message, KERN_FAILURE);
            return;
        };

        // If we're still waiting on a reply for this thread, the handler we
        // forwarded to raised it again and we'd just bounce between us
        if self.forwards.awaiting_reply(thread) {
            debug_print!("exception forwarding cycle");
            self.scratch
                .reply_to_notification(kernel, &self.message, KERN_FAILURE);
            return;
        }

        let listen_port =
            self.scratch
                .forward_notification(kernel, &handler, &self.message, self.port_set);

        let notification = self.message.notification(kernel);
        let pending = PendingReply {
            listen_port,
            reply_to: self.message.remote_port,
            behavior: notification.behavior,
            flavor: notification.state.flavor,
            thread,
        };

        if self
            .forwards
            .push(ForwardedException::Reply(pending))
            .is_err()
        {
            kernel.fatal("too many forwarded exceptions");
        }
    }

    fn handle_forward_request(&mut self) {
        let kernel = &*self.kernel;
        let Body::ForwardRequest(request) = &self.message.body else {
            kernel.fatal("message is not a forward request");
        };

        if kernel.suspend_thread(request.thread).is_err() {
            kernel.fatal("failed to suspend thread");
        }

        // Put the thread back exactly where it faulted, so the kernel raises
        // the same exception again
        if request.exception.restore(kernel, request.thread).is_err() {
            kernel.fatal("failed to restore thread context");
        }

        let replay = PendingReplay {
            thread: request.thread,
            kind: request.exception.info.kind,
            runtime_thread: request.runtime_thread,
        };

        if self
            .forwards
            .push(ForwardedException::Replay(replay))
            .is_err()
        {
            kernel.fatal("too many forwarded exceptions");
        }

        if kernel.resume_thread(request.thread).is_err() {
            kernel.fatal("failed to resume thread");
        }
    }

    fn handle_reply(&mut self, pending: Option<PendingReply>) {
        let kernel = &*self.kernel;
        let Some(pending) = pending else {
            kernel.fatal("received a reply for an exception that wasn't forwarded");
        };

        if kernel.is_thread_alive(pending.thread) {
            self.scratch.forward_reply(
                kernel,
                pending.reply_to,
                pending.behavior,
                pending.thread,
                pending.flavor,
                &self.message,
            );
        } else {
            // Nobody is waiting on the reply anymore
            debug_print!("dropping forwarded reply for exited thread");
            destroy_right(kernel, pending.reply_to);
        }

        destroy_right(kernel, pending.listen_port);
    }

    /// The handler we forwarded to dropped the reply right, so there is
    /// nothing to reply with and the exception is considered handled
    fn handle_owner_destroyed(&mut self, pending: Option<PendingReply>) {
        let kernel = &*self.kernel;
        let Some(pending) = pending else {
            kernel.fatal("received a send-once notification for an unknown port");
        };

        destroy_right(kernel, pending.listen_port);
        destroy_right(kernel, pending.reply_to);
    }
}

#[inline]
fn destroy_right(kernel: &dyn Kernel, port: Port) {
    if kernel.destroy_port(port).is_err() {
        kernel.fatal("failed to destroy a port");
    }
}
