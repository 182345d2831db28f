//! Bookkeeping for exceptions that are in the middle of being forwarded.
//!
//! This is only ever touched by the monitor thread, so it is a fixed size
//! list that never allocates.

use crate::kernel::{ExceptionBehavior, Port, ThreadId};
use exception_context::{ExceptionType, ThreadStateFlavor};

/// The maximum number of exceptions that can be in flight at once
pub const MAX_FORWARDS: usize = 64;

/// A declined exception that we've asked to be raised again, so that the
/// second delivery can be forwarded to the chain-back handler
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingReplay {
    pub thread: ThreadId,
    pub kind: ExceptionType,
    /// The thread whose chain-back table the exception is forwarded with
    pub runtime_thread: ThreadId,
}

/// A notification we've forwarded to a chain-back handler and whose reply
/// we're waiting for
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingReply {
    /// The port we created to receive the reply on
    pub listen_port: Port,
    /// The reply port of the original notification
    pub reply_to: Port,
    /// The behavior of the original notification
    pub behavior: ExceptionBehavior,
    /// The state flavor of the original notification
    pub flavor: ThreadStateFlavor,
    pub thread: ThreadId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ForwardedException {
    Replay(PendingReplay),
    Reply(PendingReply),
}

impl ForwardedException {
    #[inline]
    pub fn thread(&self) -> ThreadId {
        match self {
            Self::Replay(pr) => pr.thread,
            Self::Reply(pr) => pr.thread,
        }
    }
}

pub struct ForwardedExceptions {
    len: usize,
    records: [Option<ForwardedException>; MAX_FORWARDS],
}

impl Default for ForwardedExceptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardedExceptions {
    pub const fn new() -> Self {
        Self {
            len: 0,
            records: [None; MAX_FORWARDS],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForwardedException> {
        self.records[..self.len].iter().flatten()
    }

    /// Adds a record, handing it back if the list is full
    pub fn push(&mut self, fe: ForwardedException) -> Result<(), ForwardedException> {
        if self.len == MAX_FORWARDS {
            return Err(fe);
        }

        self.records[self.len] = Some(fe);
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, index: usize) -> Option<ForwardedException> {
        let fe = self.records[index].take();
        // Keep the records in insertion order
        self.records[index..self.len].rotate_left(1);
        self.len -= 1;
        fe
    }

    fn position(&self, pred: impl Fn(&ForwardedException) -> bool) -> Option<usize> {
        self.records[..self.len]
            .iter()
            .position(|fe| fe.as_ref().is_some_and(&pred))
    }

    /// Consumes the replay record for the exception on the thread, returning
    /// the thread whose chain-back table to forward with
    pub fn take_replay(&mut self, thread: ThreadId, kind: ExceptionType) -> Option<ThreadId> {
        let index = self.position(|fe| {
            matches!(fe, ForwardedException::Replay(pr) if pr.thread == thread && pr.kind == kind)
        })?;

        match self.remove(index) {
            Some(ForwardedException::Replay(pr)) => Some(pr.runtime_thread),
            _ => None,
        }
    }

    /// True if we've forwarded a notification for the thread that hasn't
    /// been replied to yet, which means forwarding again would cycle
    pub fn awaiting_reply(&self, thread: ThreadId) -> bool {
        self.position(|fe| matches!(fe, ForwardedException::Reply(pr) if pr.thread == thread))
            .is_some()
    }

    /// Consumes the record for the forwarded notification whose reply
    /// arrives on the port
    pub fn take_reply(&mut self, listen_port: Port) -> Option<PendingReply> {
        let index = self.position(|fe| {
            matches!(fe, ForwardedException::Reply(pr) if pr.listen_port == listen_port)
        })?;

        match self.remove(index) {
            Some(ForwardedException::Reply(pr)) => Some(pr),
            _ => None,
        }
    }

    /// Discards every record whose thread no longer exists, invoking the
    /// callback for each one
    pub fn sweep(
        &mut self,
        mut is_alive: impl FnMut(ThreadId) -> bool,
        mut removed: impl FnMut(&ForwardedException),
    ) {
        let mut i = 0;
        while i < self.len {
            let dead = self.records[i]
                .as_ref()
                .map_or(true, |fe| !is_alive(fe.thread()));

            if dead {
                if let Some(fe) = self.remove(i) {
                    removed(&fe);
                }
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reply(listen_port: Port, thread: ThreadId) -> ForwardedException {
        ForwardedException::Reply(PendingReply {
            listen_port,
            reply_to: listen_port + 1000,
            behavior: ExceptionBehavior::DEFAULT,
            flavor: ThreadStateFlavor::NONE,
            thread,
        })
    }

    #[test]
    fn replies_are_matched_by_port() {
        let mut fes = ForwardedExceptions::new();
        fes.push(reply(10, 1)).unwrap();
        fes.push(reply(20, 2)).unwrap();

        assert!(fes.awaiting_reply(1));
        assert!(!fes.awaiting_reply(3));

        let pr = fes.take_reply(20).unwrap();
        assert_eq!(pr.thread, 2);
        assert_eq!(pr.reply_to, 1020);
        assert!(fes.take_reply(20).is_none());
        assert_eq!(fes.len(), 1);
    }

    #[test]
    fn replays_are_matched_by_thread_and_kind() {
        let mut fes = ForwardedExceptions::new();
        fes.push(ForwardedException::Replay(PendingReplay {
            thread: 7,
            kind: ExceptionType::BAD_ACCESS,
            runtime_thread: 7,
        }))
        .unwrap();

        assert!(fes.take_replay(7, ExceptionType::ARITHMETIC).is_none());
        assert!(!fes.awaiting_reply(7));
        assert_eq!(fes.take_replay(7, ExceptionType::BAD_ACCESS), Some(7));
        assert!(fes.is_empty());
    }

    #[test]
    fn sweeps_dead_threads() {
        let mut fes = ForwardedExceptions::new();
        for i in 0..6 {
            fes.push(reply(i * 10, i)).unwrap();
        }

        let mut swept = Vec::new();
        fes.sweep(|thread| thread % 2 == 0, |fe| swept.push(fe.thread()));

        assert_eq!(swept, [1, 3, 5]);
        let remaining: Vec<_> = fes.iter().map(|fe| fe.thread()).collect();
        assert_eq!(remaining, [0, 2, 4]);
    }

    #[test]
    fn full_list_rejects() {
        let mut fes = ForwardedExceptions::new();
        for i in 0..MAX_FORWARDS as u32 {
            fes.push(reply(i, i)).unwrap();
        }

        assert_eq!(fes.push(reply(999, 999)), Err(reply(999, 999)));
    }
}
