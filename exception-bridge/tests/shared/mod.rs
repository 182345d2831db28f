#![allow(dead_code)]

pub use exception_bridge as eb;

use eb::{
    Body, ChainBackEntry, Config, ExceptionBehavior, ExceptionInfo, ExceptionMask, ExceptionMode,
    ExceptionType, HandlerSet, Kernel, KernelError, MemoryRegion, Message, Monitor, Notification,
    Ownership, Port, RawState, RuntimeExceptionCoordinator, ThreadId, ThreadState,
    ThreadStateFlavor, PORT_NULL,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
};

pub const TASK: Port = 0x103;
pub const PAGE_SIZE: usize = 4096;
const EXC_TYPES_COUNT: usize = 14;

/// An exception port registration slot, `(handler, behavior, flavor)`
pub type Slot = (Port, ExceptionBehavior, ThreadStateFlavor);

pub struct SimThread {
    pub state: ThreadState,
    pub alive: bool,
    pub suspend_count: i32,
    pub exception_ports: [Slot; EXC_TYPES_COUNT],
}

#[derive(Copy, Clone, Debug)]
pub struct SimRegion {
    pub start: usize,
    pub end: usize,
    /// Backed by real memory in this process, so reads are real reads
    pub backed: bool,
}

#[derive(Default)]
struct SimState {
    next_port: Port,
    port_sets: HashMap<Port, HashSet<Port>>,
    receive_ports: HashSet<Port>,
    dead_ports: HashSet<Port>,
    destroyed: Vec<Port>,
    released: Vec<Port>,
    queue: VecDeque<(Port, Message)>,
    sent: Vec<Message>,
    threads: BTreeMap<ThreadId, SimThread>,
    regions: Vec<SimRegion>,
    current_thread: ThreadId,
    fatal: Option<&'static str>,
    fail_destroy: bool,
}

/// An in-memory [`Kernel`] that delivers messages through a queue and keeps
/// simulated threads
pub struct SimKernel {
    state: Mutex<SimState>,
    /// Run whenever exception ports are swapped, without any kernel lock held
    on_swap: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_port: 0x1000,
                ..Default::default()
            }),
            on_swap: Mutex::new(None),
        }
    }

    fn alloc_port(state: &mut SimState) -> Port {
        state.next_port += 0x10;
        state.next_port
    }

    /// Creates a live thread with the state
    pub fn spawn_thread(&self, thread_state: ThreadState) -> ThreadId {
        let mut state = self.state.lock();
        let tid = Self::alloc_port(&mut state);
        state.threads.insert(
            tid,
            SimThread {
                state: thread_state,
                alive: true,
                suspend_count: 0,
                exception_ports: [(PORT_NULL, ExceptionBehavior(0), ThreadStateFlavor(0));
                    EXC_TYPES_COUNT],
            },
        );
        tid
    }

    pub fn kill_thread(&self, thread: ThreadId) {
        if let Some(st) = self.state.lock().threads.get_mut(&thread) {
            st.alive = false;
        }
    }

    pub fn thread_state(&self, thread: ThreadId) -> ThreadState {
        self.state.lock().threads[&thread].state
    }

    pub fn set_thread(&self, thread: ThreadId, ts: ThreadState) {
        if let Some(st) = self.state.lock().threads.get_mut(&thread) {
            st.state = ts;
        }
    }

    pub fn suspend_count(&self, thread: ThreadId) -> i32 {
        self.state.lock().threads[&thread].suspend_count
    }

    pub fn exception_ports(&self, thread: ThreadId) -> [Slot; EXC_TYPES_COUNT] {
        self.state.lock().threads[&thread].exception_ports
    }

    /// Makes the calling "thread" the specified one
    pub fn set_current_thread(&self, thread: ThreadId) {
        self.state.lock().current_thread = thread;
    }

    /// Turns the port into a dead name
    pub fn kill_port(&self, port: Port) {
        let mut state = self.state.lock();
        state.receive_ports.remove(&port);
        state.dead_ports.insert(port);
    }

    /// Makes every later port destruction fail
    pub fn fail_port_destruction(&self) {
        self.state.lock().fail_destroy = true;
    }

    pub fn on_swap(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_swap.lock() = Some(Box::new(hook));
    }

    pub fn add_region(&self, start: usize, len: usize, backed: bool) {
        let mut state = self.state.lock();
        state.regions.push(SimRegion {
            start,
            end: start + len,
            backed,
        });
        state.regions.sort_by_key(|r| r.start);
    }

    /// Queues a message as if it was sent to the port
    pub fn inject(&self, dest: Port, msg: Message) {
        self.state.lock().queue.push_back((dest, msg));
    }

    /// Queues a notification for the thread as the kernel would, returning
    /// the reply port the response will be sent to
    pub fn raise(
        &self,
        exception_port: Port,
        thread: ThreadId,
        kind: ExceptionType,
        codes: &[i64],
    ) -> Port {
        let reply_port = self.create_port(PORT_NULL).unwrap();
        let info = ExceptionInfo::new(kind, codes).unwrap();

        self.inject(
            exception_port,
            Message::new(
                reply_port,
                exception_port,
                Body::Notification(Notification::new(
                    ExceptionBehavior::DEFAULT.with_64bit_codes(),
                    thread,
                    TASK,
                    info,
                )),
            ),
        );

        reply_port
    }

    /// Pops the next message queued for the port
    pub fn take(&self, port: Port) -> Option<Message> {
        let mut state = self.state.lock();
        let index = state.queue.iter().position(|(dest, _)| *dest == port)?;
        state.queue.remove(index).map(|(_, msg)| msg)
    }

    pub fn sent(&self) -> Vec<Message> {
        self.state.lock().sent.clone()
    }

    pub fn sent_to(&self, port: Port) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|msg| msg.remote_port == port)
            .collect()
    }

    pub fn destroyed(&self) -> Vec<Port> {
        self.state.lock().destroyed.clone()
    }

    pub fn released(&self) -> Vec<Port> {
        self.state.lock().released.clone()
    }

    pub fn fatal_message(&self) -> Option<&'static str> {
        self.state.lock().fatal
    }
}

impl Kernel for SimKernel {
    fn create_port_set(&self) -> Result<Port, KernelError> {
        let mut state = self.state.lock();
        let set = Self::alloc_port(&mut state);
        state.port_sets.insert(set, HashSet::new());
        Ok(set)
    }

    fn create_port(&self, set: Port) -> Result<Port, KernelError> {
        let mut state = self.state.lock();
        let port = Self::alloc_port(&mut state);
        state.receive_ports.insert(port);

        if set != PORT_NULL {
            state
                .port_sets
                .get_mut(&set)
                .ok_or(KernelError::INVALID_NAME)?
                .insert(port);
        }

        Ok(port)
    }

    fn destroy_port(&self, port: Port) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.fail_destroy {
            return Err(KernelError::INVALID_NAME);
        }

        state.receive_ports.remove(&port);
        for members in state.port_sets.values_mut() {
            members.remove(&port);
        }
        state.destroyed.push(port);
        Ok(())
    }

    fn release_port(&self, port: Port) {
        self.state.lock().released.push(port);
    }

    fn is_port_alive(&self, port: Port) -> bool {
        let state = self.state.lock();
        port != PORT_NULL && !state.dead_ports.contains(&port) && state.receive_ports.contains(&port)
    }

    fn receive(&self, port: Port, msg: &mut Message) -> Result<(), KernelError> {
        let mut state = self.state.lock();

        let index = {
            let members = state.port_sets.get(&port);
            state.queue.iter().position(|(dest, _)| {
                *dest == port || members.is_some_and(|members| members.contains(dest))
            })
        };

        // The monitor would block forever
        let Some(index) = index else {
            drop(state);
            panic!("no message is queued for port {port:#x}");
        };

        let (_dest, received) = state.queue.remove(index).ok_or(KernelError::FAILURE)?;
        *msg = received;
        Ok(())
    }

    fn send(&self, msg: &Message) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        state.sent.push(*msg);

        // Deliver it the way the receiver sees it
        if state.receive_ports.contains(&msg.remote_port) {
            let received = Message::new(msg.local_port, msg.remote_port, msg.body);
            state.queue.push_back((msg.remote_port, received));
        }

        Ok(())
    }

    fn current_task(&self) -> Port {
        TASK
    }

    fn current_thread(&self) -> ThreadId {
        self.state.lock().current_thread
    }

    fn for_each_thread(&self, f: &mut dyn FnMut(ThreadId)) -> Result<(), KernelError> {
        let threads: Vec<_> = self
            .state
            .lock()
            .threads
            .iter()
            .filter_map(|(tid, st)| st.alive.then_some(*tid))
            .collect();

        for tid in threads {
            f(tid);
        }

        Ok(())
    }

    fn suspend_thread(&self, thread: ThreadId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let st = state
            .threads
            .get_mut(&thread)
            .filter(|st| st.alive)
            .ok_or(KernelError::INVALID_ARGUMENT)?;
        st.suspend_count += 1;
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let st = state
            .threads
            .get_mut(&thread)
            .filter(|st| st.alive && st.suspend_count > 0)
            .ok_or(KernelError::FAILURE)?;
        st.suspend_count -= 1;
        Ok(())
    }

    fn get_thread_state(
        &self,
        thread: ThreadId,
        flavor: ThreadStateFlavor,
        raw: &mut RawState,
    ) -> Result<(), KernelError> {
        let state = self.state.lock();
        let st = state
            .threads
            .get(&thread)
            .filter(|st| st.alive)
            .ok_or(KernelError::INVALID_ARGUMENT)?;
        *raw = st.state.raw(flavor).ok_or(KernelError::INVALID_ARGUMENT)?;
        Ok(())
    }

    fn set_thread_state(&self, thread: ThreadId, raw: &RawState) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let st = state
            .threads
            .get_mut(&thread)
            .filter(|st| st.alive)
            .ok_or(KernelError::INVALID_ARGUMENT)?;

        if st.state.set_raw(raw) {
            Ok(())
        } else {
            Err(KernelError::INVALID_ARGUMENT)
        }
    }

    fn swap_exception_ports(
        &self,
        thread: ThreadId,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: ThreadStateFlavor,
        previous: &mut HandlerSet,
    ) -> Result<(), KernelError> {
        if let Some(hook) = &*self.on_swap.lock() {
            hook();
        }

        let mut state = self.state.lock();
        let st = state
            .threads
            .get_mut(&thread)
            .ok_or(KernelError::INVALID_ARGUMENT)?;

        previous.clear();
        for kind in mask.types() {
            let Some(slot) = st.exception_ports.get_mut(kind.0 as usize) else {
                continue;
            };

            // Identical registrations are reported as a single entry
            if let Some(entry) = previous
                .entries_mut()
                .iter_mut()
                .find(|e| (e.handler, e.behavior, e.flavor) == *slot)
            {
                entry.mask |= kind.mask();
            } else {
                previous.push(ChainBackEntry {
                    mask: kind.mask(),
                    handler: slot.0,
                    behavior: slot.1,
                    flavor: slot.2,
                });
            }

            *slot = (port, behavior, flavor);
        }

        Ok(())
    }

    fn set_exception_ports(&self, thread: ThreadId, entry: &ChainBackEntry) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let st = state
            .threads
            .get_mut(&thread)
            .ok_or(KernelError::INVALID_ARGUMENT)?;

        for kind in entry.mask.types() {
            if let Some(slot) = st.exception_ports.get_mut(kind.0 as usize) {
                *slot = (entry.handler, entry.behavior, entry.flavor);
            }
        }

        Ok(())
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn region_at(&self, addr: usize) -> Option<MemoryRegion> {
        self.state
            .lock()
            .regions
            .iter()
            .find(|r| r.end > addr)
            .map(|r| MemoryRegion {
                start: r.start,
                end: r.end,
            })
    }

    fn read_word(&self, addr: usize) -> Result<usize, KernelError> {
        let region = self
            .state
            .lock()
            .regions
            .iter()
            .find(|r| addr >= r.start && addr.saturating_add(std::mem::size_of::<usize>()) <= r.end)
            .copied()
            .ok_or(KernelError::INVALID_ADDRESS)?;

        if region.backed {
            // SAFETY: backed regions are live memory owned by the test
            Ok(unsafe { std::ptr::read_unaligned(addr as *const usize) })
        } else {
            Ok(0)
        }
    }

    fn fatal(&self, msg: &'static str) -> ! {
        self.state.lock().fatal = Some(msg);
        panic!("fatal: {msg}");
    }
}

/// Runs the closure, which must end in [`Kernel::fatal`], returning the
/// fatal message
pub fn expect_fatal(kernel: &SimKernel, f: impl FnOnce()) -> &'static str {
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    assert!(res.is_err(), "expected a fatal error");
    kernel.fatal_message().expect("panicked without calling fatal")
}

/// A real stack for simulated threads, hijacking writes into it
pub struct SimStack {
    mem: Box<[u128]>,
}

impl SimStack {
    pub const SIZE: usize = 64 * 1024;

    /// Allocates the stack and registers it with the kernel
    pub fn new(kernel: &SimKernel) -> Self {
        let stack = Self {
            mem: vec![0u128; Self::SIZE / 16].into_boxed_slice(),
        };
        kernel.add_region(stack.bottom(), Self::SIZE, true);
        stack
    }

    #[inline]
    pub fn bottom(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.bottom() + Self::SIZE
    }
}

/// Code we own, the simulated threads fault in here
pub const OWNED_CODE: usize = 0x4000_0000;
/// Code we don't own
pub const FOREIGN_CODE: usize = 0x7000_0000;
/// The image range handed to the coordinator, nothing faults in it
pub const IMAGE: std::ops::Range<usize> = 0x1000_0000..0x1100_0000;

pub struct Harness {
    pub kernel: Arc<SimKernel>,
    pub coordinator: RuntimeExceptionCoordinator,
    pub monitor: Monitor,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let kernel = Arc::new(SimKernel::new());
        let dyn_kernel: Arc<dyn Kernel> = kernel.clone();

        let coordinator =
            RuntimeExceptionCoordinator::new(dyn_kernel, config, Ownership::new(IMAGE)).unwrap();
        coordinator.register_owned_region(OWNED_CODE, 0x1000, eb::RegionKind::ExecutableHeap);
        let monitor = coordinator.take_monitor().unwrap();

        Self {
            kernel,
            coordinator,
            monitor,
        }
    }

    /// A harness that hooks every exception
    pub fn hook_all() -> Self {
        Self::new(Config {
            mode: ExceptionMode::empty(),
            fault_injection: None,
        })
    }

    #[inline]
    pub fn exception_port(&self) -> Port {
        self.coordinator.exception_port()
    }

    /// Spawns a thread stopped at the pc, using the stack
    pub fn spawn(&self, stack: &SimStack, pc: usize) -> ThreadId {
        let mut ts = ThreadState::zeroed();
        ts.set_pc(pc);
        ts.set_sp(stack.top() - 1024);
        self.kernel.spawn_thread(ts)
    }

    /// Registers a handler that isn't us for the exception on the thread,
    /// before we are registered
    pub fn add_foreign_handler(&self, thread: ThreadId, mask: ExceptionMask) -> Port {
        let port = self.kernel.create_port(PORT_NULL).unwrap();
        self.kernel
            .set_exception_ports(
                thread,
                &ChainBackEntry {
                    mask,
                    handler: port,
                    behavior: ExceptionBehavior::STATE_IDENTITY.with_64bit_codes(),
                    flavor: ThreadStateFlavor::GENERAL,
                },
            )
            .unwrap();
        port
    }

    /// Runs the dispatch routine the way the hijacked thread would
    pub fn run_hijacked(&self, thread: ThreadId) -> eb::DispatchOutcome {
        let regs = self.kernel.thread_state(thread).general;
        let dispatcher = self.coordinator.dispatcher();

        assert_eq!(regs.argument(3), Arc::as_ptr(dispatcher) as usize);

        self.kernel.set_current_thread(thread);

        // SAFETY: the pointers are into the frame the hijacker wrote on the
        // thread's stack
        unsafe {
            dispatcher.dispatch_on(
                thread,
                &mut *(regs.argument(0) as *mut ThreadState),
                &*(regs.argument(1) as *const eb::ExceptionRecord),
                &*(regs.argument(2) as *const eb::CapturedException),
            )
        }
    }
}

/// The reply body of a message, panicking if it isn't one
pub fn reply_of(msg: &Message) -> eb::Reply {
    match msg.body {
        Body::Reply(reply) => reply,
        other => panic!("expected a reply, got {other:?}"),
    }
}

pub fn notification_of(msg: &Message) -> Notification {
    match msg.body {
        Body::Notification(n) => n,
        other => panic!("expected a notification, got {other:?}"),
    }
}
