//! Trace driver
//!
//! A `Tracer` runs a dashboard against one backend: it reconciles settings
//! on every (re)connect, polls connections and packets on independent
//! timers while a device is traced, and feeds the results to the registry.
//! It runs one step at a time on the caller's thread, so registry and
//! settings are only ever touched from there.
//!
//! Interactive front ends should not drive a `Tracer` from their event
//! loop: backend calls such as `TraceDevice` may ask the user for
//! permission while they are in flight. `Tracer::spawn` moves the tracer
//! to its own thread and talks to it over channels instead.

use crate::flow::locate::{LocalLocator, LocationResolutionError};
use crate::flow::view::{self, ProjectedView, ViewOptions};
use crate::flow::{ConnectionsDelta, FlowRegistry};
use crate::remote::{Backend, Device, RemoteError};
use crate::settings::{Settings, SettingsStore, SettingsSync, UpdateError};
use crate::wire;

use crossbeam::channel;
use std::thread;
use std::time::{Duration, Instant};

/// How long a spawned tracer waits for timers before checking commands.
const WORKER_STEP: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub enum TraceEvent {
    /// A link to the backend was (re)established and settings reconciled.
    Connected {
        sync_errors: Vec<RemoteError>,
        location: Result<(), LocationResolutionError>,
    },
    Disconnected,
    Connections(ConnectionsDelta),
    /// Number of packets appended to the window.
    Packets(usize),
    PollFailed(RemoteError),
    /// Any other session event.
    Session(wire::Event),
}

/// Requests to a tracer running on its own thread.
#[derive(Debug)]
pub enum Command {
    /// Same as a fresh connect: reconcile settings and locate.
    Resync,
    Start(Device),
    Stop,
    SetView(ViewOptions),
    SetSummarized(bool),
}

/// State published by a spawned tracer after anything changed.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub view: ProjectedView,
    pub options: ViewOptions,
    pub device: Option<Device>,
    pub flow_count: usize,
    pub settings: Settings,
}

#[derive(Debug)]
pub enum Update {
    Event(TraceEvent),
    StartFailed(RemoteError),
    SettingFailed(UpdateError),
    Snapshot(Snapshot),
}

/// Handle to a tracer running on its own thread. Dropping it stops the
/// tracer and waits for the thread.
pub struct TraceHandle {
    commands: Option<channel::Sender<Command>>,
    updates: channel::Receiver<Update>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TraceHandle {
    /// Queues `command`; false if the tracer thread is gone.
    pub fn send(&self, command: Command) -> bool {
        match &self.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    pub fn updates(&self) -> &channel::Receiver<Update> {
        &self.updates
    }

    pub fn close(self) {}
}

impl Drop for TraceHandle {
    fn drop(&mut self) {
        self.commands = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("tracer thread panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    Session,
    Connections,
    Packets,
}

pub struct Tracer<B: Backend, S: SettingsStore> {
    backend: B,
    settings: SettingsSync<S>,
    registry: FlowRegistry,
    locator: LocalLocator,
    device: Option<Device>,
    connections_timer: Option<channel::Receiver<Instant>>,
    packets_timer: Option<channel::Receiver<Instant>>,
    session_events: Option<channel::Receiver<wire::Event>>,
    view: ViewOptions,
}

impl<B: Backend, S: SettingsStore> Tracer<B, S> {
    pub fn new(backend: B, settings: SettingsSync<S>) -> Tracer<B, S> {
        let mut registry = FlowRegistry::new();
        registry.set_summarized(settings.settings().summarized);
        let view = ViewOptions {
            summarized: settings.settings().summarized,
            ..Default::default()
        };
        Tracer {
            backend,
            settings,
            registry,
            locator: LocalLocator::new(),
            device: None,
            connections_timer: None,
            packets_timer: None,
            session_events: None,
            view,
        }
    }

    /// Reacts to link changes reported on `events`.
    pub fn watch_session(&mut self, events: channel::Receiver<wire::Event>) {
        self.session_events = Some(events);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &Settings {
        self.settings.settings()
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn is_tracing(&self) -> bool {
        self.device.is_some()
    }

    /// Reconciles settings and looks up the local location, then resumes
    /// tracing the current device if there is one.
    pub fn on_connect(&mut self) -> TraceEvent {
        let mut sync_errors = self.settings.synchronize(&self.backend);
        let location = match self.locator.resolve_with(&self.backend, self.settings.settings()) {
            Ok(loc) => {
                self.registry.set_local_location(Some(loc));
                Ok(())
            }
            Err(e) => Err(e),
        };
        if let Some(device) = &self.device {
            if let Err(e) = self.backend.trace_device(device) {
                sync_errors.push(e);
            }
        }
        self.restart_timers();
        TraceEvent::Connected {
            sync_errors,
            location,
        }
    }

    /// Starts tracing `device`, replacing any previous trace.
    pub fn start(&mut self, device: Device) -> Result<(), RemoteError> {
        self.stop();
        self.backend.trace_device(&device)?;
        tracing::info!(device = %device.pcap_name, "tracing device");
        self.registry.clear();
        self.device = Some(device);
        self.restart_timers();
        Ok(())
    }

    /// Stops polling. The registry keeps its contents.
    pub fn stop(&mut self) {
        self.connections_timer = None;
        self.packets_timer = None;
        self.device = None;
    }

    fn restart_timers(&mut self) {
        if self.device.is_none() {
            return;
        }
        let settings = self.settings.settings();
        self.connections_timer = Some(channel::tick(settings.connections_interval));
        self.packets_timer = Some(channel::tick(settings.packets_interval));
    }

    pub fn poll_connections(&mut self) -> TraceEvent {
        match self.backend.get_connections() {
            Ok(snapshot) => TraceEvent::Connections(
                self.registry
                    .apply_connections(snapshot, self.settings.settings()),
            ),
            Err(e) => TraceEvent::PollFailed(e),
        }
    }

    pub fn poll_packets(&mut self) -> TraceEvent {
        match self.backend.get_packets() {
            Ok(snapshot) => {
                TraceEvent::Packets(self.registry.apply_packets(snapshot, self.settings.settings()))
            }
            Err(e) => TraceEvent::PollFailed(e),
        }
    }

    /// Waits up to `timeout` for a timer or session event and handles it.
    pub fn step(&mut self, timeout: Duration) -> Option<TraceEvent> {
        let ready = {
            let mut sel = channel::Select::new();
            let mut sources = Vec::with_capacity(3);
            if let Some(rx) = &self.session_events {
                sel.recv(rx);
                sources.push(Source::Session);
            }
            if let Some(rx) = &self.connections_timer {
                sel.recv(rx);
                sources.push(Source::Connections);
            }
            if let Some(rx) = &self.packets_timer {
                sel.recv(rx);
                sources.push(Source::Packets);
            }
            if sources.is_empty() {
                std::thread::sleep(timeout);
                return None;
            }
            match sel.ready_timeout(timeout) {
                Ok(index) => sources[index],
                Err(channel::ReadyTimeoutError) => return None,
            }
        };

        match ready {
            Source::Session => {
                let res = self.session_events.as_ref().map(|rx| rx.try_recv());
                match res {
                    Some(Ok(event)) => Some(self.on_session_event(event)),
                    Some(Err(channel::TryRecvError::Disconnected)) => {
                        self.session_events = None;
                        None
                    }
                    _ => None,
                }
            }
            Source::Connections => {
                if let Some(rx) = &self.connections_timer {
                    let _ = rx.try_recv();
                }
                Some(self.poll_connections())
            }
            Source::Packets => {
                if let Some(rx) = &self.packets_timer {
                    let _ = rx.try_recv();
                }
                Some(self.poll_packets())
            }
        }
    }

    fn on_session_event(&mut self, event: wire::Event) -> TraceEvent {
        match event {
            wire::Event::Connected => self.on_connect(),
            wire::Event::Disconnected => TraceEvent::Disconnected,
            other => TraceEvent::Session(other),
        }
    }

    /// Switches summarization, locally and on the backend. The packet
    /// window restarts either way; a failed push is returned.
    pub fn set_summarized(&mut self, summarized: bool) -> Result<(), crate::settings::UpdateError> {
        self.registry.set_summarized(summarized);
        self.view.summarized = summarized;
        self.settings.set_summarized(&self.backend, summarized)
    }

    /// Gives access to the settings with the backend they sync against.
    /// Timers pick up changed intervals on return.
    pub fn update_settings<R>(&mut self, f: impl FnOnce(&mut SettingsSync<S>, &B) -> R) -> R {
        let before = self.settings.settings().clone();
        let res = f(&mut self.settings, &self.backend);
        let after = self.settings.settings().clone();
        if before.connections_interval != after.connections_interval
            || before.packets_interval != after.packets_interval
        {
            self.restart_timers();
        }
        if before.summarized != after.summarized {
            let summarized = after.summarized;
            self.registry.set_summarized(summarized);
            self.view.summarized = summarized;
        }
        res
    }

    pub fn view_options(&self) -> &ViewOptions {
        &self.view
    }

    /// Filter and sort of the table. Summarization follows the settings.
    pub fn set_view_options(&mut self, options: ViewOptions) {
        self.view = ViewOptions {
            summarized: self.settings.settings().summarized,
            ..options
        };
    }

    pub fn view(&self) -> ProjectedView {
        view::project(self.registry.packets(), &self.view)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            view: self.view(),
            options: self.view.clone(),
            device: self.device.clone(),
            flow_count: self.registry.flow_count(),
            settings: self.settings.settings().clone(),
        }
    }

    fn handle_command(&mut self, command: Command) -> Option<Update> {
        match command {
            Command::Resync => Some(Update::Event(self.on_connect())),
            Command::Start(device) => self.start(device).err().map(Update::StartFailed),
            Command::Stop => {
                self.stop();
                None
            }
            Command::SetView(options) => {
                self.set_view_options(options);
                None
            }
            Command::SetSummarized(summarized) => {
                self.set_summarized(summarized).err().map(Update::SettingFailed)
            }
        }
    }

    fn serve(mut self, commands: channel::Receiver<Command>, updates: channel::Sender<Update>) {
        let mut dirty = true;
        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        dirty = true;
                        if let Some(update) = self.handle_command(command) {
                            if updates.send(update).is_err() {
                                return;
                            }
                        }
                    }
                    Err(channel::TryRecvError::Empty) => break,
                    Err(channel::TryRecvError::Disconnected) => {
                        self.stop();
                        return;
                    }
                }
            }
            if dirty {
                if updates.send(Update::Snapshot(self.snapshot())).is_err() {
                    return;
                }
                dirty = false;
            }
            if let Some(event) = self.step(WORKER_STEP) {
                dirty = true;
                if updates.send(Update::Event(event)).is_err() {
                    return;
                }
            }
        }
    }
}

impl<B, S> Tracer<B, S>
where
    B: Backend + Send + 'static,
    S: SettingsStore + Send + 'static,
{
    /// Moves the tracer to a thread of its own.
    pub fn spawn(self) -> TraceHandle {
        let (cmd_tx, cmd_rx) = channel::unbounded();
        let (update_tx, update_rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("connview-tracer".into())
            .spawn(move || self.serve(cmd_rx, update_tx));
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(e) => {
                tracing::error!(error = %e, "cannot start tracer thread");
                None
            }
        };
        TraceHandle {
            commands: Some(cmd_tx),
            updates: update_rx,
            thread,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::PacketObservation;
    use crate::remote::MockBackend;
    use crate::settings::MemoryStore;

    fn tracer(backend: MockBackend) -> Tracer<MockBackend, MemoryStore> {
        Tracer::new(backend, SettingsSync::load(MemoryStore::default()).unwrap())
    }

    #[test]
    fn nothing_to_do_until_started() {
        let mut t = tracer(MockBackend::new());
        assert!(t.step(Duration::from_millis(5)).is_none());
        assert!(!t.is_tracing());
    }

    #[test]
    fn start_polls_both_timers() {
        let backend = MockBackend::new();
        backend.push_packets(vec![PacketObservation {
            timestamp: 10,
            src_ip: "a".into(),
            ..Default::default()
        }]);
        let mut t = tracer(backend);
        t.update_settings(|s, _| {
            s.set_intervals(Duration::from_millis(10), Duration::from_millis(10))
                .unwrap()
        });
        t.start(Device {
            pcap_name: "eth0".into(),
            ..Default::default()
        })
        .unwrap();

        let mut saw_connections = false;
        let mut saw_packets = false;
        for _ in 0..20 {
            match t.step(Duration::from_millis(100)) {
                Some(TraceEvent::Connections(_)) => saw_connections = true,
                Some(TraceEvent::Packets(_)) => saw_packets = true,
                _ => {}
            }
            if saw_connections && saw_packets {
                break;
            }
        }
        assert!(saw_connections && saw_packets);
        assert_eq!(t.view().rows.len(), 1);
        assert_eq!(t.backend().traced()[0].pcap_name, "eth0");
    }

    #[test]
    fn stop_drops_timers() {
        let mut t = tracer(MockBackend::new());
        t.start(Device::default()).unwrap();
        t.stop();
        assert!(t.step(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn settings_update_picks_up_summarized_flag() {
        let mut t = tracer(MockBackend::new());
        t.start(Device::default()).unwrap();
        t.update_settings(|s, b| s.set_summarized(b, true)).unwrap();
        assert!(t.view_options().summarized);
        assert!(t.registry().is_summarized());
        assert!(t.backend().is_summarized());
    }

    #[test]
    fn spawned_tracer_reports_snapshots() {
        let backend = MockBackend::new();
        backend.push_packets(vec![PacketObservation {
            timestamp: 1,
            src_ip: "a".into(),
            ..Default::default()
        }]);
        let mut t = tracer(backend);
        t.update_settings(|s, _| {
            s.set_intervals(Duration::from_millis(10), Duration::from_millis(10))
                .unwrap()
        });
        let handle = t.spawn();
        assert!(handle.send(Command::Start(Device {
            pcap_name: "eth0".into(),
            ..Default::default()
        })));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut rows = 0;
        while rows == 0 && Instant::now() < deadline {
            if let Ok(Update::Snapshot(s)) = handle.updates().recv_timeout(Duration::from_millis(100)) {
                if s.device.is_some() {
                    rows = s.view.rows.len();
                }
            }
        }
        assert_eq!(rows, 1);
        handle.close();
    }

    #[test]
    fn summarize_toggle_pushes_and_clears() {
        let backend = MockBackend::new();
        let mut t = tracer(backend);
        t.start(Device::default()).unwrap();
        t.backend().push_packets(vec![PacketObservation::default()]);
        t.poll_packets();
        assert_eq!(t.registry().packets().len(), 1);
        t.set_summarized(true).unwrap();
        assert!(t.backend().is_summarized());
        assert!(t.registry().packets().is_empty());
        assert!(t.view_options().summarized);
    }
}
