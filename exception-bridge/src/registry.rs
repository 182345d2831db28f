//! The per-thread chain-back tables, ie. the exception handlers that were
//! registered for a thread before we registered our own.

use crate::{
    error::Error,
    kernel::{ExceptionBehavior, Kernel, Port, ThreadId, PORT_NULL},
};
use exception_context::{ExceptionMask, ExceptionType, ThreadStateFlavor, EXC_TYPES_COUNT};
use std::collections::HashMap;

/// The maximum number of entries, enough for one entry per exception type
pub const MAX_HANDLERS: usize = EXC_TYPES_COUNT;

/// A previously registered exception handler
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChainBackEntry {
    /// The exceptions the handler is registered for
    pub mask: ExceptionMask,
    /// The port that is sent messages when the exception occurs
    pub handler: Port,
    /// The way in which the exception is raised
    pub behavior: ExceptionBehavior,
    /// The CPU context included with the exception
    pub flavor: ThreadStateFlavor,
}

impl ChainBackEntry {
    const EMPTY: Self = Self {
        mask: ExceptionMask::empty(),
        handler: PORT_NULL,
        behavior: ExceptionBehavior(0),
        flavor: ThreadStateFlavor(0),
    };
}

/// A fixed size set of handler registrations, as returned by
/// `thread_swap_exception_ports`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandlerSet {
    count: usize,
    entries: [ChainBackEntry; MAX_HANDLERS],
}

impl Default for HandlerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerSet {
    #[inline]
    pub const fn new() -> Self {
        Self {
            count: 0,
            entries: [ChainBackEntry::EMPTY; MAX_HANDLERS],
        }
    }

    /// Appends an entry, returning false if the set is full
    #[inline]
    pub fn push(&mut self, entry: ChainBackEntry) -> bool {
        if self.count == MAX_HANDLERS {
            return false;
        }

        self.entries[self.count] = entry;
        self.count += 1;
        true
    }

    #[inline]
    pub fn clear(&mut self) {
        self.count = 0;
    }

    #[inline]
    pub fn entries(&self) -> &[ChainBackEntry] {
        &self.entries[..self.count]
    }

    #[inline]
    pub fn entries_mut(&mut self) -> &mut [ChainBackEntry] {
        &mut self.entries[..self.count]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Removes entries that no longer cover any exception
    fn compact(&mut self) {
        let mut kept = 0;
        for i in 0..self.count {
            if !self.entries[i].mask.is_empty() {
                self.entries[kept] = self.entries[i];
                kept += 1;
            }
        }
        self.count = kept;
    }
}

/// Replaces any of our own registrations in the handlers we just swapped out
/// with what we saved the last time we installed ourselves, so that we never
/// chain back to ourselves.
///
/// Entries that cover several exceptions but need a different chain-back
/// target for one of them are split, so that every entry still covers a
/// disjoint set of exceptions.
fn scrub_own(swapped: &mut HandlerSet, saved: &HandlerSet, own: Port) {
    let original_count = swapped.count;

    for i in 0..original_count {
        if swapped.entries[i].handler != own {
            continue;
        }

        for kind in swapped.entries[i].mask.types() {
            let bit = kind.mask();

            match saved.entries().iter().find(|e| e.mask.intersects(bit)) {
                Some(prev) if swapped.entries[i].mask == bit => {
                    // The entry only covered this exception, just take over
                    // the previous handler
                    let entry = &mut swapped.entries[i];
                    entry.handler = prev.handler;
                    entry.behavior = prev.behavior;
                    entry.flavor = prev.flavor;
                }
                Some(prev) => {
                    // There is always room to split since there is at most
                    // one entry per exception type
                    let split = ChainBackEntry { mask: bit, ..*prev };
                    if swapped.push(split) {
                        swapped.entries[i].mask -= bit;
                    } else {
                        swapped.entries[i].mask -= bit;
                        log::warn!("ran out of room splitting chain-back entries for {kind}");
                    }
                }
                None => {
                    // We were registered but had nothing saved, which means
                    // there is nothing to chain back to
                    swapped.entries[i].mask -= bit;
                }
            }
        }

        // If every exception for the entry was removed, the entry is empty,
        // if it was taken over it is no longer ours
        if swapped.entries[i].handler == own {
            swapped.entries[i].mask = ExceptionMask::empty();
        }
    }

    swapped.compact();
}

/// The handlers that were registered for a single thread before we installed
/// our own exception port
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainBackTable {
    saved: HandlerSet,
}

impl ChainBackTable {
    /// Registers our port for the exceptions in the mask on the thread,
    /// saving the handlers that were registered before us.
    ///
    /// Installing more than once is fine, our own port is never recorded as
    /// a chain-back target.
    pub fn install_self(
        &mut self,
        kernel: &dyn Kernel,
        thread: ThreadId,
        own_port: Port,
        mask: ExceptionMask,
        behavior: ExceptionBehavior,
        flavor: ThreadStateFlavor,
    ) -> Result<(), Error> {
        // Swap into temporary storage first, as some or all of the handlers
        // might be our own already and we don't want to overwrite the saved
        // entries with self references
        let mut swapped = HandlerSet::new();
        kernel
            .swap_exception_ports(thread, mask, own_port, behavior, flavor, &mut swapped)
            .map_err(|err| Error::Registration { thread, err })?;

        scrub_own(&mut swapped, &self.saved, own_port);

        log::debug!(
            "installed exception port {own_port} on thread {thread}, {} chain-back entries",
            swapped.len()
        );

        self.saved = swapped;
        Ok(())
    }

    /// Registers each of the saved handlers back on the thread
    pub fn restore_previous(&self, kernel: &dyn Kernel, thread: ThreadId) -> Result<(), Error> {
        for entry in self.saved.entries() {
            // If no handler was ever set, the swap returns a null port with
            // zero behavior and flavor, which are not accepted when setting
            let restore = ChainBackEntry {
                behavior: if entry.behavior.0 == 0 {
                    ExceptionBehavior::DEFAULT
                } else {
                    entry.behavior
                },
                flavor: if entry.flavor.0 == 0 {
                    ThreadStateFlavor::GENERAL
                } else {
                    entry.flavor
                },
                ..*entry
            };

            kernel
                .set_exception_ports(thread, &restore)
                .map_err(|err| Error::Registration { thread, err })?;
        }

        log::debug!("restored {} exception handlers on thread {thread}", self.saved.len());
        Ok(())
    }

    /// Finds the handler to forward the exception to, if there is a live one
    pub fn lookup(&self, kernel: &dyn Kernel, kind: ExceptionType) -> Option<ChainBackEntry> {
        let bit = kind.mask();
        if bit.is_empty() {
            return None;
        }

        self.saved
            .entries()
            .iter()
            .find(|e| e.mask.intersects(bit))
            .filter(|e| kernel.is_port_alive(e.handler))
            .copied()
    }

    #[inline]
    pub fn entries(&self) -> &[ChainBackEntry] {
        self.saved.entries()
    }
}

/// The chain-back tables of every thread we've registered on
#[derive(Default)]
pub struct RegistryIndex {
    tables: parking_lot::Mutex<HashMap<ThreadId, ChainBackTable>>,
}

impl RegistryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs our port on the thread, creating its table if needed.
    ///
    /// The lock is not held while registering, the monitor takes it to look
    /// up handlers and must never wait on a thread that may fault.
    pub fn install(
        &self,
        kernel: &dyn Kernel,
        thread: ThreadId,
        own_port: Port,
        mask: ExceptionMask,
        behavior: ExceptionBehavior,
        flavor: ThreadStateFlavor,
    ) -> Result<(), Error> {
        let mut table = self.table(thread).unwrap_or_default();
        table.install_self(kernel, thread, own_port, mask, behavior, flavor)?;
        self.tables.lock().insert(thread, table);
        Ok(())
    }

    /// Restores the thread's previous handlers and forgets its table
    pub fn uninstall(&self, kernel: &dyn Kernel, thread: ThreadId) -> Result<(), Error> {
        let table = self.tables.lock().remove(&thread);
        match table {
            Some(table) => table.restore_previous(kernel, thread),
            None => Ok(()),
        }
    }

    /// Finds the chain-back handler for the exception on the thread
    pub fn lookup(
        &self,
        kernel: &dyn Kernel,
        thread: ThreadId,
        kind: ExceptionType,
    ) -> Option<ChainBackEntry> {
        let table = self.table(thread)?;
        table.lookup(kernel, kind)
    }

    /// A copy of the thread's table
    pub fn table(&self, thread: ThreadId) -> Option<ChainBackTable> {
        self.tables.lock().get(&thread).cloned()
    }
}
