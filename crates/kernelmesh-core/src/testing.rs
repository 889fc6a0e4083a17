//! In-memory doubles for the kernel boundaries.
//!
//! Namespace switching is simulated with a thread-local "active namespace"
//! so doubles can record *where* each operation ran. Handles are backed by
//! `/dev/null` descriptors and never touch real namespaces.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use kernelmesh_common::error::{KernelmeshError, Result};
use kernelmesh_common::types::MacAddress;

use crate::link::LinkOps;
use crate::namespace::{NetnsSwitcher, NsHandle};
use crate::sysctl::KernelFs;
use crate::vf::VfConfig;

/// Namespace every thread starts in.
pub const ROOT_NETNS: &str = "root";

thread_local! {
    static ACTIVE: RefCell<String> = RefCell::new(ROOT_NETNS.to_string());
}

/// Namespace the calling thread is in, as seen by [`FakeNetns`].
#[must_use]
pub fn active_netns() -> String {
    ACTIVE.with(|active| active.borrow().clone())
}

fn null_handle(origin: &str) -> Result<NsHandle> {
    let file = File::open("/dev/null").map_err(|e| KernelmeshError::Io {
        path: "/dev/null".into(),
        source: e,
    })?;
    Ok(NsHandle::new(OwnedFd::from(file), origin))
}

/// Namespace operation observed by [`FakeNetns`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsEvent {
    /// A namespace was opened by URL.
    Opened(String),
    /// The calling thread switched into a namespace.
    Entered(String),
}

/// Simulated [`NetnsSwitcher`].
#[derive(Debug, Default)]
pub struct FakeNetns {
    events: Mutex<Vec<NsEvent>>,
    refuse: Mutex<HashSet<String>>,
}

impl FakeNetns {
    /// Creates a switcher that accepts every namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `enter` into `url` fail.
    pub fn fail_enter(&self, url: &str) {
        let _ = self
            .refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string());
    }

    /// All observed events in order.
    #[must_use]
    pub fn events(&self) -> Vec<NsEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Namespaces successfully entered, in order.
    #[must_use]
    pub fn entered(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                NsEvent::Entered(url) => Some(url),
                NsEvent::Opened(_) => None,
            })
            .collect()
    }

    fn record(&self, event: NsEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl NetnsSwitcher for FakeNetns {
    fn current(&self) -> Result<NsHandle> {
        null_handle(&active_netns())
    }

    fn open(&self, url: &str) -> Result<NsHandle> {
        self.record(NsEvent::Opened(url.to_string()));
        null_handle(url)
    }

    fn enter(&self, ns: &NsHandle) -> Result<()> {
        let refused = self
            .refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(ns.origin());
        if refused {
            return Err(KernelmeshError::Namespace {
                url: ns.origin().to_string(),
                message: "setns refused".into(),
            });
        }
        ACTIVE.with(|active| *active.borrow_mut() = ns.origin().to_string());
        self.record(NsEvent::Entered(ns.origin().to_string()));
        Ok(())
    }
}

/// A sysctl write observed by [`RecordingFs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsWrite {
    /// Path relative to the sysctl root.
    pub path: String,
    /// Value written.
    pub value: String,
    /// Namespace the writing thread was in.
    pub netns: String,
}

/// Recording [`KernelFs`].
#[derive(Debug, Default)]
pub struct RecordingFs {
    writes: Mutex<Vec<FsWrite>>,
    failing: AtomicBool,
}

impl RecordingFs {
    /// Creates a filesystem that accepts every write.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful writes in order.
    #[must_use]
    pub fn writes(&self) -> Vec<FsWrite> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl KernelFs for RecordingFs {
    fn write_sysctl(&self, relative: &str, value: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(KernelmeshError::Configuration {
                target: relative.to_string(),
                message: "write refused".into(),
            });
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FsWrite {
                path: relative.to_string(),
                value: value.to_string(),
                netns: active_netns(),
            });
        Ok(())
    }
}

/// Link operation kinds recorded by [`FakeLinks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOp {
    /// [`LinkOps::set_hw_address`].
    SetHwAddress,
    /// [`LinkOps::create_vf`].
    CreateVf,
    /// [`LinkOps::destroy_vf`].
    DestroyVf,
    /// [`LinkOps::move_link`].
    MoveLink,
}

/// A successful link operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCall {
    /// Operation kind.
    pub op: LinkOp,
    /// What the operation acted on, formatted per kind.
    pub subject: String,
    /// Namespace the calling thread was in.
    pub netns: String,
}

/// Holds callers of one link operation until opened.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    waiting: usize,
    open: bool,
}

impl Gate {
    /// Blocks until at least one caller is held at the gate.
    pub fn wait_for_caller(&self) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        drop(
            self.changed
                .wait_while(state, |s| s.waiting == 0 && !s.open)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    /// Lets every held and later caller through.
    pub fn open(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open = true;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.waiting += 1;
        self.changed.notify_all();
        let mut state = self
            .changed
            .wait_while(state, |s| !s.open)
            .unwrap_or_else(PoisonError::into_inner);
        state.waiting -= 1;
    }
}

/// Recording [`LinkOps`].
#[derive(Debug, Default)]
pub struct FakeLinks {
    calls: Mutex<Vec<LinkCall>>,
    failing: Mutex<HashSet<LinkOp>>,
    failing_once: Mutex<HashSet<LinkOp>>,
    gates: Mutex<HashMap<LinkOp, Arc<Gate>>>,
}

impl FakeLinks {
    /// Creates a double that accepts every operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `op` fail.
    pub fn fail(&self, op: LinkOp) {
        let _ = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op);
    }

    /// Lets `op` succeed again.
    pub fn succeed(&self, op: LinkOp) {
        let _ = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&op);
    }

    /// Makes the next `op` fail; later ones succeed.
    pub fn fail_once(&self, op: LinkOp) {
        let _ = self
            .failing_once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op);
    }

    /// Holds every later `op` at the returned gate until it is opened.
    pub fn gate(&self, op: LinkOp) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        let _ = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op, Arc::clone(&gate));
        gate
    }

    /// Successful operations in order.
    #[must_use]
    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful `op` calls.
    #[must_use]
    pub fn count(&self, op: LinkOp) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    fn record(&self, op: LinkOp, subject: String) -> Result<()> {
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&op)
            .map(Arc::clone);
        if let Some(gate) = gate {
            gate.pass();
        }
        let refused = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&op)
            || self
                .failing_once
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&op);
        if refused {
            return Err(KernelmeshError::Configuration {
                target: subject,
                message: format!("{op:?} refused"),
            });
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LinkCall {
                op,
                subject,
                netns: active_netns(),
            });
        Ok(())
    }
}

impl LinkOps for FakeLinks {
    fn set_hw_address(&self, link: &str, mac: MacAddress) -> Result<()> {
        self.record(LinkOp::SetHwAddress, format!("{link} {mac}"))
    }

    fn create_vf(&self, vf: &VfConfig) -> Result<()> {
        self.record(LinkOp::CreateVf, vf.key())
    }

    fn destroy_vf(&self, vf: &VfConfig) -> Result<()> {
        self.record(LinkOp::DestroyVf, vf.key())
    }

    fn move_link(&self, link: &str, new_name: &str, dest: &NsHandle) -> Result<()> {
        self.record(
            LinkOp::MoveLink,
            format!("{link} -> {new_name} @ {}", dest.origin()),
        )
    }
}
