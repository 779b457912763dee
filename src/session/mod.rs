//! A rally session: one process converging on the rally point of one rally name.

pub mod policy;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::key::Key;
use crate::node::node_data::NodeData;
use crate::overlay::{Overlay, OverlayHandle};
use crate::peer::filter_valid;
use crate::rally::rally_point;
use crate::session::policy::{decide, Decision};
use crate::twiddle::twiddle_march;
use crate::{RALLY_LOOKUP_COUNT, SEARCH_INTERVAL};

/// A notification from a session to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The session joined the overlay with a new key.
    Rejoined(Key),
    /// The addresses of the rally members found by the latest search.
    PeersFound(Vec<SocketAddr>),
    /// Something went wrong. The session keeps running.
    Error(Error),
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not a member of the overlay, either joining for the first time or after a failed join.
    Bootstrapping,
    /// Joined and waiting for the next search.
    Idle,
    /// Searching the overlay for the rally point.
    Searching,
    /// Weighing the search results.
    Deciding,
    /// Moving to a key closer to the rally point.
    Relocating,
    /// Left the overlay for good.
    Destroyed,
}

/// Tunes how a `Session` joins the overlay and how often it searches.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Discover peers when first joining, and search the rally point periodically. Without it the
    /// session only searches on `Session::search_now`.
    pub bootstrap_into_overlay: bool,
    /// The time between the end of one periodic search and the start of the next.
    pub search_interval: Duration,
    /// How many nodes close to the rally point are considered on every search.
    pub lookup_count: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            bootstrap_into_overlay: true,
            search_interval: Duration::from_secs(SEARCH_INTERVAL),
            lookup_count: RALLY_LOOKUP_COUNT,
        }
    }
}

enum Command {
    Search,
    Tick,
    Destroy(Box<dyn FnOnce() + Send>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State visible from both the session handle and its worker.
struct Shared {
    destroyed: AtomicBool,
    state: Mutex<State>,
    local_id: Mutex<Key>,
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl Shared {
    fn emit(&self, event: Event) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// A handle to a running rally session.
///
/// The session runs on its own thread, so at most one join, search or relocation is in flight
/// at a time. Dropping the handle destroys the session.
pub struct Session {
    rally_name: String,
    rally_point: Key,
    shared: Arc<Shared>,
    commands: Sender<Command>,
}

impl Session {
    /// Starts a session converging on the rally point of `rally_name` over `overlay`. The
    /// returned receiver is subscribed before the session starts, so it sees every event.
    pub fn spawn<O: Overlay>(
        rally_name: &str,
        overlay: O,
        options: SessionOptions,
    ) -> Result<(Session, Receiver<Event>)> {
        if rally_name.is_empty() {
            return Err(Error::EmptyRallyName);
        }
        let rally_point = rally_point(rally_name);
        let local_id = Key::rand().with_tag(rally_point.tag());
        info!("Using rally point {} ({})", rally_name, rally_point);

        let (event_tx, event_rx) = channel();
        let shared = Arc::new(Shared {
            destroyed: AtomicBool::new(false),
            state: Mutex::new(State::Bootstrapping),
            local_id: Mutex::new(local_id),
            subscribers: Mutex::new(vec![event_tx]),
        });
        let (command_tx, command_rx) = channel();

        let worker = Worker {
            rally_point,
            overlay,
            handle: None,
            local_id,
            options,
            next_search: None,
            shared: Arc::clone(&shared),
        };
        thread::spawn(move || worker.run(command_rx));

        let session = Session {
            rally_name: rally_name.to_string(),
            rally_point,
            shared,
            commands: command_tx,
        };
        Ok((session, event_rx))
    }

    /// Registers another observer. It receives the events emitted from now on.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// The name the session was started with.
    pub fn rally_name(&self) -> &str {
        &self.rally_name
    }

    /// The point of the keyspace derived from the rally name.
    pub fn rally_point(&self) -> Key {
        self.rally_point
    }

    /// The key the session currently presents, or will present once joined.
    pub fn local_id(&self) -> Key {
        *lock(&self.shared.local_id)
    }

    /// Where the session is in its lifecycle.
    pub fn state(&self) -> State {
        *lock(&self.shared.state)
    }

    /// Asks for a search as soon as the cycle in flight, if any, completes.
    pub fn search_now(&self) {
        let _ = self.commands.send(Command::Search);
    }

    /// Leaves the overlay and then calls `on_complete` on another thread. No search starts once
    /// this returns. Calling it again only calls `on_complete`.
    ///
    /// If a relocation is in flight, it finishes leaving its old key and does not join again.
    pub fn destroy<F>(&self, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            thread::spawn(on_complete);
            return;
        }
        debug!("Destroying all connections");
        if let Err(err) = self.commands.send(Command::Destroy(Box::new(on_complete))) {
            // the worker is gone, so there is nothing left to tear down
            if let Command::Destroy(on_complete) = err.0 {
                thread::spawn(on_complete);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.shared.is_destroyed() {
            self.destroy(|| {});
        }
    }
}

/// The state machine behind a `Session`, driven by commands and the search timer.
struct Worker<O: Overlay> {
    rally_point: Key,
    overlay: O,
    handle: Option<O::Handle>,
    local_id: Key,
    options: SessionOptions,
    next_search: Option<Instant>,
    shared: Arc<Shared>,
}

impl<O: Overlay> Worker<O> {
    fn run(mut self, commands: Receiver<Command>) {
        self.start();
        loop {
            let command = match self.next_search {
                Some(at) => {
                    let wait = at.saturating_duration_since(Instant::now());
                    match commands.recv_timeout(wait) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => Command::Tick,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                },
                None => match commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Search => self.cycle(),
                Command::Tick => {
                    self.cycle();
                    // re-armed only once the cycle is over
                    self.next_search = Some(Instant::now() + self.options.search_interval);
                },
                Command::Destroy(on_complete) => {
                    self.teardown();
                    on_complete();
                    return;
                },
            }
        }
        self.teardown();
    }

    fn set_state(&self, state: State) {
        *lock(&self.shared.state) = state;
    }

    fn set_local_id(&mut self, id: Key) {
        self.local_id = id;
        *lock(&self.shared.local_id) = id;
    }

    fn fail(&self, err: Error) {
        warn!("{}", err);
        self.shared.emit(Event::Error(err));
    }

    /// Joins the overlay with the current key and, on the first successful join with bootstrap
    /// enabled, searches right away and arms the search timer.
    fn start(&mut self) {
        if self.shared.is_destroyed() {
            return;
        }
        let bootstrap = self.options.bootstrap_into_overlay;
        self.set_state(State::Bootstrapping);
        if let Err(err) = self.join(self.local_id, bootstrap) {
            self.fail(err);
            return;
        }
        self.set_state(State::Idle);
        if bootstrap && self.next_search.is_none() && !self.shared.is_destroyed() {
            debug!("Searching, and creating interval for future searches");
            self.search();
            self.next_search = Some(Instant::now() + self.options.search_interval);
        }
    }

    /// Joins the overlay as `id` and announces the key the overlay reports.
    fn join(&mut self, id: Key, bootstrap: bool) -> Result<()> {
        info!(
            "Joining network with id {} (distance to rally {:?})",
            id,
            id.xor(&self.rally_point)
        );
        match self.overlay.join(id, bootstrap) {
            Ok(handle) => {
                let id = handle.local_id();
                self.handle = Some(handle);
                self.set_local_id(id);
                self.shared.emit(Event::Rejoined(id));
                Ok(())
            },
            Err(err) => Err(Error::Join(err.to_string())),
        }
    }

    fn cycle(&mut self) {
        if self.shared.is_destroyed() {
            return;
        }
        if self.handle.is_none() {
            // a previous join failed
            self.start();
        } else {
            self.search();
        }
    }

    fn search(&mut self) {
        let rally_point = self.rally_point;
        let count = self.options.lookup_count;
        self.set_state(State::Searching);
        debug!("Searching for nodes near rally point");

        let lookup = match self.handle.as_mut() {
            Some(handle) => handle
                .lookup_closest(&rally_point, count)
                .map(|_| handle.closest_known_nodes(&rally_point, count)),
            None => return,
        };
        let closest = match lookup {
            Ok(closest) => closest,
            Err(err) => {
                self.set_state(State::Idle);
                self.fail(Error::Lookup(err.to_string()));
                return;
            },
        };

        self.set_state(State::Deciding);
        let peers = filter_valid(&closest, &rally_point, &self.local_id);
        let decision = match decide(&rally_point, &self.local_id, &closest, &peers) {
            Ok(decision) => decision,
            Err(err) => {
                self.set_state(State::Idle);
                self.fail(err);
                return;
            },
        };
        self.shared
            .emit(Event::PeersFound(peers.iter().map(|peer| peer.addr).collect()));

        match decision {
            Decision::Hold => {
                debug!("We are already at the rally point. Keep hanging out.");
                self.set_state(State::Idle);
            },
            Decision::Occupied => {
                debug!("Another peer is already at the rally point - so we won't move.");
                self.set_state(State::Idle);
            },
            Decision::Relocate { competitor } => {
                if peers.is_empty() {
                    debug!("No peers found, so it's up to us to hang out at the rally point");
                } else {
                    debug!("Peers exist but far away - it's up to us to go to the rally point");
                }
                debug!("The closest other node is {}", competitor);
                self.relocate(competitor, closest);
            },
        }
    }

    /// Moves to a key closer to the rally point than `competitor`, then announces the new key to
    /// the nodes in `closest`.
    fn relocate(&mut self, competitor: Key, closest: Vec<NodeData>) {
        self.set_state(State::Relocating);
        let id = match twiddle_march(&self.rally_point, &competitor, &self.local_id) {
            Ok(id) => id,
            // unreachable from `search`, which never relocates away from a competitor at the point
            Err(err) => {
                self.set_state(State::Idle);
                self.fail(err);
                return;
            },
        };

        debug!("Waddling closer to the rally point destroying old DHT connection");
        if let Some(handle) = self.handle.take() {
            handle.leave();
        }
        debug!("Old DHT connection destroyed");
        if self.shared.is_destroyed() {
            info!("Destroyed while relocating, not joining again");
            return;
        }

        self.set_local_id(id);
        if let Err(err) = self.join(id, true) {
            self.set_state(State::Bootstrapping);
            self.fail(err);
            return;
        }
        if let Some(handle) = self.handle.as_mut() {
            debug!("Saying hi to {} nodes so they know about us", closest.len());
            for node_data in closest {
                handle.add_known_node(node_data);
            }
        }
        self.set_state(State::Idle);
    }

    fn teardown(&mut self) {
        self.next_search = None;
        if let Some(handle) = self.handle.take() {
            handle.leave();
        }
        self.set_state(State::Destroyed);
        info!("Session destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Receiver};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{Event, Session, SessionOptions, State};
    use crate::error::{Error, OverlayError};
    use crate::key::Key;
    use crate::node::node_data::NodeData;
    use crate::overlay::{Overlay, OverlayHandle};
    use crate::rally::rally_point;

    /// What the scripted overlay answers and what it was asked.
    #[derive(Default)]
    struct Script {
        closest: Vec<NodeData>,
        include_self: bool,
        fail_join: bool,
        fail_lookup: bool,
        leave_delay: Duration,
        joins: Vec<Key>,
        leaves: usize,
        hints: Vec<NodeData>,
    }

    #[derive(Clone, Default)]
    struct ScriptedOverlay(Arc<Mutex<Script>>);

    struct ScriptedHandle {
        id: Key,
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedOverlay {
        fn script(&self) -> std::sync::MutexGuard<Script> {
            self.0.lock().unwrap()
        }
    }

    impl Overlay for ScriptedOverlay {
        type Handle = ScriptedHandle;

        fn join(&mut self, id: Key, _bootstrap: bool) -> Result<ScriptedHandle, OverlayError> {
            let mut script = self.script();
            if script.fail_join {
                return Err(OverlayError::Unreachable(1));
            }
            script.joins.push(id);
            Ok(ScriptedHandle {
                id,
                script: Arc::clone(&self.0),
            })
        }
    }

    impl OverlayHandle for ScriptedHandle {
        fn local_id(&self) -> Key {
            self.id
        }

        fn closest_known_nodes(&self, target: &Key, count: usize) -> Vec<NodeData> {
            let script = self.script.lock().unwrap();
            let mut ret = script.closest.clone();
            if script.include_self {
                ret.push(NodeData::new(([127, 0, 0, 1], 1).into(), self.id));
            }
            ret.sort_by_key(|node_data| node_data.id.xor(target));
            ret.truncate(count);
            ret
        }

        fn lookup_closest(
            &mut self,
            target: &Key,
            count: usize,
        ) -> Result<Vec<NodeData>, OverlayError> {
            if self.script.lock().unwrap().fail_lookup {
                return Err(OverlayError::Unreachable(3));
            }
            Ok(self.closest_known_nodes(target, count))
        }

        fn add_known_node(&mut self, node: NodeData) {
            self.script.lock().unwrap().hints.push(node);
        }

        fn leave(self) {
            let delay = self.script.lock().unwrap().leave_delay;
            thread::sleep(delay);
            self.script.lock().unwrap().leaves += 1;
        }
    }

    fn manual() -> SessionOptions {
        SessionOptions {
            bootstrap_into_overlay: false,
            ..SessionOptions::default()
        }
    }

    fn next_event(events: &Receiver<Event>) -> Event {
        events.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn assert_quiet(events: &Receiver<Event>) {
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    }

    fn wait_for_state(session: &Session, state: State) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.state() != state {
            assert!(Instant::now() < deadline, "stuck in {:?}", session.state());
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn node(port: u16, id: Key) -> NodeData {
        NodeData::new(([10, 0, 0, 3], port).into(), id)
    }

    fn near(rally: &Key, bit: usize) -> Key {
        rally.with_bit(bit, !rally.bit(bit))
    }

    #[test]
    fn test_empty_rally_name_is_rejected() {
        let result = Session::spawn("", ScriptedOverlay::default(), manual());
        assert_eq!(result.err(), Some(Error::EmptyRallyName));
    }

    #[test]
    fn test_bootstrap_joins_with_tagged_key() {
        let overlay = ScriptedOverlay::default();
        let (session, events) = Session::spawn("tagged", overlay.clone(), manual()).unwrap();

        let id = match next_event(&events) {
            Event::Rejoined(id) => id,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(id, session.local_id());
        assert_eq!(id.tag(), rally_point("tagged").tag());
        assert_eq!(session.rally_point(), rally_point("tagged"));
        assert_eq!(session.rally_name(), "tagged");
        assert_eq!(overlay.script().joins, vec![id]);
        assert_quiet(&events);
    }

    #[test]
    fn test_sole_occupant_stays() {
        let overlay = ScriptedOverlay::default();
        overlay.script().include_self = true;
        let (session, events) = Session::spawn("sole", overlay.clone(), manual()).unwrap();
        next_event(&events);

        for _ in 0..3 {
            session.search_now();
            assert_eq!(next_event(&events), Event::PeersFound(Vec::new()));
        }
        assert_quiet(&events);
        assert_eq!(overlay.script().joins.len(), 1);
        assert_eq!(overlay.script().leaves, 0);
        assert_eq!(session.state(), State::Idle);
    }

    #[test]
    fn test_peer_at_point_stays() {
        let rally = rally_point("contested");
        let member = node(7000, near(&rally, 140));
        let overlay = ScriptedOverlay::default();
        {
            let mut script = overlay.script();
            script.closest = vec![member.clone(), node(7001, Key::rand())];
            script.include_self = true;
        }
        let (session, events) = Session::spawn("contested", overlay.clone(), manual()).unwrap();
        let id = match next_event(&events) {
            Event::Rejoined(id) => id,
            other => panic!("unexpected event {:?}", other),
        };

        session.search_now();
        assert_eq!(next_event(&events), Event::PeersFound(vec![member.addr]));
        assert_quiet(&events);
        assert_eq!(session.local_id(), id);
        assert_eq!(overlay.script().leaves, 0);
    }

    #[test]
    fn test_unclaimed_point_relocates() {
        let rally = rally_point("unclaimed");
        let outsider = node(7000, near(&rally, 120).with_tag([!rally.0[18], rally.0[19]]));
        let member = node(7001, near(&rally, 2));
        let overlay = ScriptedOverlay::default();
        overlay.script().closest = vec![outsider.clone(), member.clone()];
        let (session, events) = Session::spawn("unclaimed", overlay.clone(), manual()).unwrap();
        let old_id = match next_event(&events) {
            Event::Rejoined(id) => id,
            other => panic!("unexpected event {:?}", other),
        };

        session.search_now();
        assert_eq!(next_event(&events), Event::PeersFound(vec![member.addr]));
        let new_id = match next_event(&events) {
            Event::Rejoined(id) => id,
            other => panic!("unexpected event {:?}", other),
        };

        assert_ne!(new_id, old_id);
        assert_eq!(new_id.tag(), rally.tag());
        assert!(new_id.xor(&rally) < outsider.id.xor(&rally));
        assert_eq!(session.local_id(), new_id);
        wait_for_state(&session, State::Idle);

        let script = overlay.script();
        assert_eq!(script.joins, vec![old_id, new_id]);
        assert_eq!(script.leaves, 1);
        assert_eq!(script.hints, vec![outsider, member]);
    }

    #[test]
    fn test_relocations_keep_tag() {
        for round in 0..20 {
            let name = format!("round {}", round);
            let rally = rally_point(&name);
            let overlay = ScriptedOverlay::default();
            overlay.script().closest = vec![node(7000, near(&rally, 60).with_tag([0, 0]))];
            let (session, events) = Session::spawn(&name, overlay.clone(), manual()).unwrap();
            next_event(&events);

            session.search_now();
            next_event(&events);
            match next_event(&events) {
                Event::Rejoined(id) => assert_eq!(id.tag(), rally.tag()),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_no_connectivity_is_reported() {
        let overlay = ScriptedOverlay::default();
        let (session, events) = Session::spawn("offline", overlay, manual()).unwrap();
        next_event(&events);

        session.search_now();
        assert_eq!(next_event(&events), Event::Error(Error::NoConnectivity));
        assert_quiet(&events);
        assert_eq!(session.state(), State::Idle);
    }

    #[test]
    fn test_lookup_failure_is_reported() {
        let overlay = ScriptedOverlay::default();
        overlay.script().fail_lookup = true;
        let (session, events) = Session::spawn("flaky", overlay, manual()).unwrap();
        next_event(&events);

        session.search_now();
        match next_event(&events) {
            Event::Error(Error::Lookup(_)) => {},
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.state(), State::Idle);
    }

    #[test]
    fn test_join_failure_is_reported() {
        let overlay = ScriptedOverlay::default();
        overlay.script().fail_join = true;
        let (session, events) = Session::spawn("unjoinable", overlay.clone(), manual()).unwrap();

        match next_event(&events) {
            Event::Error(Error::Join(_)) => {},
            other => panic!("unexpected event {:?}", other),
        }
        assert_quiet(&events);
        assert_eq!(session.state(), State::Bootstrapping);

        // a manual search retries the join
        overlay.script().fail_join = false;
        session.search_now();
        assert_eq!(next_event(&events), Event::Rejoined(session.local_id()));
    }

    #[test]
    fn test_failed_rejoin_is_retried_with_new_key() {
        let rally = rally_point("stranded");
        let competitor = node(7000, near(&rally, 100).with_tag([0, 0]));
        let overlay = ScriptedOverlay::default();
        overlay.script().closest = vec![competitor.clone()];
        let (session, events) = Session::spawn("stranded", overlay.clone(), manual()).unwrap();
        let old_id = match next_event(&events) {
            Event::Rejoined(id) => id,
            other => panic!("unexpected event {:?}", other),
        };

        overlay.script().fail_join = true;
        session.search_now();
        assert_eq!(next_event(&events), Event::PeersFound(Vec::new()));
        match next_event(&events) {
            Event::Error(Error::Join(_)) => {},
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.state(), State::Bootstrapping);
        let new_id = session.local_id();
        assert_ne!(new_id, old_id);
        assert_eq!(new_id.tag(), rally.tag());
        assert!(new_id.xor(&rally) < competitor.id.xor(&rally));

        overlay.script().fail_join = false;
        session.search_now();
        assert_eq!(next_event(&events), Event::Rejoined(new_id));
        wait_for_state(&session, State::Idle);

        let script = overlay.script();
        assert_eq!(script.joins, vec![old_id, new_id]);
        assert_eq!(script.leaves, 1);
    }

    #[test]
    fn test_drop_destroys_session() {
        let overlay = ScriptedOverlay::default();
        let (session, events) = Session::spawn("dropped", overlay.clone(), manual()).unwrap();
        next_event(&events);

        drop(session);
        let deadline = Instant::now() + Duration::from_secs(5);
        while overlay.script().leaves == 0 {
            assert!(Instant::now() < deadline, "session was not destroyed");
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(overlay.script().leaves, 1);
        assert_eq!(overlay.script().joins.len(), 1);
    }

    #[test]
    fn test_bootstrap_searches_immediately() {
        let overlay = ScriptedOverlay::default();
        overlay.script().include_self = true;
        let (_session, events) =
            Session::spawn("eager", overlay, SessionOptions::default()).unwrap();

        match next_event(&events) {
            Event::Rejoined(_) => {},
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(next_event(&events), Event::PeersFound(Vec::new()));
    }

    #[test]
    fn test_timer_repeats_searches() {
        let overlay = ScriptedOverlay::default();
        overlay.script().include_self = true;
        let options = SessionOptions {
            search_interval: Duration::from_millis(50),
            ..SessionOptions::default()
        };
        let (session, events) = Session::spawn("ticking", overlay, options).unwrap();
        next_event(&events);
        for _ in 0..3 {
            assert_eq!(next_event(&events), Event::PeersFound(Vec::new()));
        }

        let (done_tx, done_rx) = channel();
        session.destroy(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        while events.try_recv().is_ok() {}
        assert_quiet(&events);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let overlay = ScriptedOverlay::default();
        let (session, events) = Session::spawn("twice", overlay.clone(), manual()).unwrap();
        next_event(&events);

        let (done_tx, done_rx) = channel();
        let first = done_tx.clone();
        session.destroy(move || first.send("first").unwrap());
        session.destroy(move || done_tx.send("second").unwrap());

        let mut calls = vec![
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        calls.sort();
        assert_eq!(calls, vec!["first", "second"]);
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

        wait_for_state(&session, State::Destroyed);
        assert_eq!(overlay.script().leaves, 1);
    }

    #[test]
    fn test_destroy_during_relocation_abandons_rejoin() {
        let rally = rally_point("interrupted");
        let overlay = ScriptedOverlay::default();
        {
            let mut script = overlay.script();
            script.closest = vec![node(7000, near(&rally, 100).with_tag([0, 0]))];
            script.leave_delay = Duration::from_millis(300);
        }
        let (session, events) = Session::spawn("interrupted", overlay.clone(), manual()).unwrap();
        next_event(&events);

        session.search_now();
        wait_for_state(&session, State::Relocating);
        let (done_tx, done_rx) = channel();
        session.destroy(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(session.state(), State::Destroyed);
        let script = overlay.script();
        assert_eq!(script.joins.len(), 1);
        assert_eq!(script.leaves, 1);
        assert!(script.hints.is_empty());
    }

    #[test]
    fn test_every_subscriber_is_notified() {
        let overlay = ScriptedOverlay::default();
        overlay.script().include_self = true;
        let (session, first) = Session::spawn("crowd", overlay, manual()).unwrap();
        next_event(&first);

        let second = session.subscribe();
        session.search_now();
        assert_eq!(next_event(&first), Event::PeersFound(Vec::new()));
        assert_eq!(next_event(&second), Event::PeersFound(Vec::new()));
    }
}
