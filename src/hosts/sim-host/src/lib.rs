//! A scripted stand-in for the host application.
//!
//! `SimHost` keeps a small in-memory project model, a cooperative task
//! queue and an extended-state store, and answers the native API calls the
//! bridge's wrappers rely on. It lets the agent and a real client talk over
//! TCP without the host application installed.

mod natives;
mod server;

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use reabridge::host::{Deferred, Host, HostCallError};
use serde_json::Value;
use tracing::trace;

pub use natives::NATIVES;
pub use server::{spawn, SimServer};

/// Ticks per quarter note of every take.
pub const PPQ: f64 = 480.0;
pub const DEFAULT_BPM: f64 = 120.0;

/// Command id of "File: Close current project tab".
pub const CLOSE_PROJECT_TAB: i64 = 40860;
/// Command id of "File: New project tab".
pub const NEW_PROJECT_TAB: i64 = 40859;

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub index: i64,
    pub position: f64,
    pub name: String,
}

#[derive(Debug)]
struct Item {
    handle: String,
    take: String,
    selected: bool,
}

#[derive(Debug)]
struct Project {
    handle: String,
    bpm: f64,
    cursor: f64,
    markers: Vec<Marker>,
    items: Vec<Item>,
}

#[derive(Debug, Default)]
struct World {
    projects: Vec<Project>,
    current: usize,
    next_address: u64,
    ext_state: BTreeMap<(String, String), String>,
    persisted: BTreeSet<(String, String)>,
    console: String,
    actions: Vec<String>,
}

impl World {
    fn pointer(&mut self, pointer_type: &str) -> String {
        self.next_address += 0x40;
        format!("({pointer_type})0x{:016X}", 0x1000_0000 + self.next_address)
    }

    fn open_project(&mut self) -> String {
        let handle = self.pointer("ReaProject*");
        self.projects.push(Project {
            handle: handle.clone(),
            bpm: DEFAULT_BPM,
            cursor: 0.0,
            markers: Vec::new(),
            items: Vec::new(),
        });
        self.current = self.projects.len() - 1;
        handle
    }

    fn close_current(&mut self) {
        if self.current < self.projects.len() {
            self.projects.remove(self.current);
        }
        if self.projects.is_empty() {
            self.open_project();
        }
        self.current = self.current.min(self.projects.len() - 1);
    }

    fn project(&self, handle: &str) -> Option<&Project> {
        self.projects.iter().find(|project| project.handle == handle)
    }

    fn project_mut(&mut self, handle: &str) -> Option<&mut Project> {
        self.projects
            .iter_mut()
            .find(|project| project.handle == handle)
    }

    fn current_project(&self) -> Option<&Project> {
        self.projects.get(self.current)
    }

    fn take_owner(&self, take: &str) -> Option<&Project> {
        self.projects
            .iter()
            .find(|project| project.items.iter().any(|item| item.take == take))
    }

    fn has_item(&self, handle: &str) -> bool {
        self.projects
            .iter()
            .any(|project| project.items.iter().any(|item| item.handle == handle))
    }

    fn active_take(&self, item: &str) -> Option<&str> {
        self.projects
            .iter()
            .flat_map(|project| project.items.iter())
            .find(|candidate| candidate.handle == item)
            .map(|item| item.take.as_str())
    }
}

/// In-memory host. Lives on one thread, like the real script environment.
pub struct SimHost {
    world: RefCell<World>,
    queue: RefCell<VecDeque<Deferred>>,
    exits: RefCell<Vec<Deferred>>,
    resource_dir: PathBuf,
    tick: Duration,
}

impl SimHost {
    /// A host with one empty project open.
    pub fn new(resource_dir: impl Into<PathBuf>) -> Self {
        let mut world = World::default();
        world.open_project();
        Self {
            world: RefCell::new(world),
            queue: RefCell::new(VecDeque::new()),
            exits: RefCell::new(Vec::new()),
            resource_dir: resource_dir.into(),
            tick: Duration::from_millis(1),
        }
    }

    /// Pause between scheduler ticks in [`SimHost::run`].
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn current_project(&self) -> String {
        self.world
            .borrow()
            .current_project()
            .map(|project| project.handle.clone())
            .unwrap_or_default()
    }

    pub fn open_project(&self) -> String {
        self.world.borrow_mut().open_project()
    }

    pub fn close_current_project(&self) {
        self.world.borrow_mut().close_current();
    }

    /// Adds an item with one take to `project` and returns the take handle.
    pub fn add_item(&self, project: &str, selected: bool) -> Option<String> {
        let mut world = self.world.borrow_mut();
        let item = world.pointer("MediaItem*");
        let take = world.pointer("MediaItem_Take*");
        let target = world.project_mut(project)?;
        target.items.push(Item {
            handle: item,
            take: take.clone(),
            selected,
        });
        Some(take)
    }

    pub fn bpm(&self, project: &str) -> Option<f64> {
        self.world.borrow().project(project).map(|project| project.bpm)
    }

    pub fn markers(&self, project: &str) -> Vec<Marker> {
        self.world
            .borrow()
            .project(project)
            .map(|project| project.markers.clone())
            .unwrap_or_default()
    }

    pub fn console(&self) -> String {
        self.world.borrow().console.clone()
    }

    pub fn is_persisted(&self, section: &str, key: &str) -> bool {
        self.world
            .borrow()
            .persisted
            .contains(&(section.to_string(), key.to_string()))
    }

    pub fn actions(&self) -> Vec<String> {
        self.world.borrow().actions.clone()
    }

    /// Runs the tasks queued before this tick. Returns how many ran.
    pub fn run_once(&self) -> usize {
        let pending: Vec<Deferred> = self.queue.borrow_mut().drain(..).collect();
        let count = pending.len();
        for task in pending {
            task();
        }
        count
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    /// Ticks until `stop` is raised, then runs the exit hooks.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            self.run_once();
            thread::sleep(self.tick);
        }
        self.exit();
    }

    /// Runs the exit hooks, as when the script environment shuts down.
    pub fn exit(&self) {
        let exits: Vec<Deferred> = self.exits.borrow_mut().drain(..).collect();
        for task in exits {
            task();
        }
    }
}

impl Host for SimHost {
    fn call(&self, name: &str, args: &[Value]) -> Result<Value, HostCallError> {
        trace!(function = name, "native call");
        natives::call(&mut self.world.borrow_mut(), name, args)
    }

    fn function_names(&self) -> Vec<String> {
        NATIVES.iter().map(|name| name.to_string()).collect()
    }

    fn ext_state_get(&self, section: &str, key: &str) -> Option<String> {
        self.world
            .borrow()
            .ext_state
            .get(&(section.to_string(), key.to_string()))
            .cloned()
    }

    fn ext_state_set(&self, section: &str, key: &str, value: &str, persist: bool) {
        let entry = (section.to_string(), key.to_string());
        let mut world = self.world.borrow_mut();
        if persist {
            world.persisted.insert(entry.clone());
        } else {
            world.persisted.remove(&entry);
        }
        world.ext_state.insert(entry, value.to_string());
    }

    fn ext_state_delete(&self, section: &str, key: &str, _persist: bool) {
        let entry = (section.to_string(), key.to_string());
        let mut world = self.world.borrow_mut();
        world.persisted.remove(&entry);
        world.ext_state.remove(&entry);
    }

    fn defer(&self, task: Deferred) {
        self.queue.borrow_mut().push_back(task);
    }

    fn at_exit(&self, task: Deferred) {
        self.exits.borrow_mut().push(task);
    }

    fn register_action(&self, script: &str) -> Result<String, HostCallError> {
        let mut hasher = DefaultHasher::new();
        script.hash(&mut hasher);
        let token = format!("_RS{:016x}", hasher.finish());
        let mut world = self.world.borrow_mut();
        if !world.actions.contains(&token) {
            world.actions.push(token.clone());
        }
        Ok(token)
    }

    fn resource_path(&self) -> PathBuf {
        self.resource_dir.clone()
    }
}
