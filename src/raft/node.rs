//! The Raft node: the consensus state machine that sequences client
//! mutations through a leader and feeds committed entries into the
//! storage engine via the replicated log.
//!
//! # Roles and transitions
//!
//! ```text
//!                 election timeout
//!   Follower ──────────────────────► Candidate
//!      ▲                                │
//!      │  higher term observed          │ majority of votes
//!      │  (any RPC)                     ▼
//!      └────────────────────────────  Leader
//! ```
//!
//! A node starts as follower. The timer thread waits out a per-term
//! randomized election timeout; if no valid heartbeat arrived in that
//! window it campaigns: bump term, vote for itself, fan out vote requests
//! in parallel, and take leadership on a strict majority. Leadership is
//! surrendered the moment any RPC carries a higher term.
//!
//! # Replication
//!
//! The leader runs one shipper thread per peer. A shipper sends batched
//! `AppendEntries` while the peer is behind, backing up `next_index` on
//! mismatch, and falls back to heartbeats when the peer is caught up.
//! After each acknowledged batch it recomputes the highest index
//! replicated on a majority (counting only entries of the current term)
//! and advances the commit point, which wakes the apply worker and any
//! client waiting in `put`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{NodeAddr, RaftConfig};
use crate::db::Db;
use crate::error::Error;
use crate::pool::ThreadPool;
use crate::raft::log::RaftLog;
use crate::raft::message::{
    code, AppendRequest, AppendResponse, GetResponse, Op, PutResponse, VoteRequest, VoteResponse,
};
use crate::raft::transport::{now_ms, Peer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct RoleState {
    role: Role,
    term: u64,
    voted_for: Option<u32>,
    leader_id: Option<u32>,
}

pub struct Node {
    local: NodeAddr,
    config: RaftConfig,
    state: Mutex<RoleState>,
    /// Wall-clock millis of the last valid peer contact; read by the
    /// timer thread without taking the state mutex.
    last_heartbeat_ms: AtomicU64,
    log: Arc<RaftLog>,
    db: Arc<Db>,
    peers: Vec<Arc<Peer>>,
    stop: AtomicBool,
    timer_mutex: Mutex<()>,
    timer_cv: Condvar,
    ship_mutex: Mutex<()>,
    ship_cv: Condvar,
    shippers: Mutex<Vec<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    /// Fan-out pool for parallel peer RPCs (votes, read-barrier rounds).
    rpc_pool: ThreadPool,
}

impl Node {
    /// Constructs the node and starts its election timer thread.
    pub fn spawn(
        local: NodeAddr,
        peers: Vec<Peer>,
        db: Arc<Db>,
        log: Arc<RaftLog>,
        config: RaftConfig,
    ) -> Arc<Node> {
        let rpc_pool = ThreadPool::new(peers.len().max(1) * 2, "emberkv-rpc");
        let node = Arc::new(Node {
            local,
            config,
            state: Mutex::new(RoleState {
                role: Role::Follower,
                term: 0,
                voted_for: None,
                leader_id: None,
            }),
            last_heartbeat_ms: AtomicU64::new(now_ms()),
            log,
            db,
            peers: peers.into_iter().map(Arc::new).collect(),
            stop: AtomicBool::new(false),
            timer_mutex: Mutex::new(()),
            timer_cv: Condvar::new(),
            ship_mutex: Mutex::new(()),
            ship_cv: Condvar::new(),
            shippers: Mutex::new(Vec::new()),
            timer_thread: Mutex::new(None),
            rpc_pool,
        });

        let timer_node = Arc::clone(&node);
        let handle = thread::spawn(move || run_timer(timer_node));
        *node.timer_thread.lock().unwrap() = Some(handle);
        node
    }

    pub fn id(&self) -> u32 {
        self.local.id
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.local
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn log(&self) -> &Arc<RaftLog> {
        &self.log
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    pub fn term(&self) -> u64 {
        self.state.lock().unwrap().term
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// The believed leader's address, when one is known.
    pub fn leader_hint(&self) -> Option<NodeAddr> {
        let st = self.state.lock().unwrap();
        self.leader_addr_locked(&st)
    }

    fn leader_addr_locked(&self, st: &MutexGuard<'_, RoleState>) -> Option<NodeAddr> {
        let leader_id = st.leader_id?;
        if leader_id == self.local.id {
            return Some(self.local.clone());
        }
        self.peers
            .iter()
            .find(|peer| peer.id() == leader_id)
            .map(|peer| peer.addr.clone())
    }

    fn is_leader_for(&self, term: u64) -> bool {
        let st = self.state.lock().unwrap();
        st.role == Role::Leader && st.term == term
    }

    fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::SeqCst);
    }

    // ---- client surface ----

    /// Replicates a write. Returns `not_leader` with a redirect when this
    /// node is not the leader, and blocks until the entry is committed on
    /// a majority otherwise.
    pub fn put(&self, key: &[u8], value: &[u8]) -> PutResponse {
        self.mutate(key, value.to_vec(), Op::Put)
    }

    /// Replicates a deletion.
    pub fn delete(&self, key: &[u8]) -> PutResponse {
        self.mutate(key, Vec::new(), Op::Delete)
    }

    fn mutate(&self, key: &[u8], value: Vec<u8>, op: Op) -> PutResponse {
        let term = {
            let st = self.state.lock().unwrap();
            if st.role != Role::Leader {
                return PutResponse::not_leader(self.leader_addr_locked(&st));
            }
            st.term
        };

        let index = match self.log.append(key.to_vec(), value, op, term) {
            Ok(index) => index,
            Err(Error::LogFull) => {
                tracing::warn!("rejecting write, replicated log is full");
                return PutResponse::failure();
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to append to replicated log");
                return PutResponse::failure();
            }
        };
        self.notify_shippers();
        // A single-node cluster commits on append.
        self.advance_commit(term);

        loop {
            match self.log.wait_committed(index, Duration::from_millis(100)) {
                Ok(true) => return PutResponse::ok(),
                Ok(false) => {
                    if self.stop.load(Ordering::SeqCst) || !self.is_leader_for(term) {
                        return PutResponse::failure();
                    }
                }
                Err(_) => return PutResponse::failure(),
            }
        }
    }

    /// Serves a read. With `read_from_leader` the call redirects unless
    /// this node is the leader and a majority heartbeat round confirms it
    /// still is; plain reads answer from the local engine and may lag.
    pub fn get(&self, key: &[u8], read_from_leader: bool) -> GetResponse {
        if read_from_leader {
            let term = {
                let st = self.state.lock().unwrap();
                if st.role != Role::Leader {
                    return GetResponse::not_leader(self.leader_addr_locked(&st));
                }
                st.term
            };
            if !self.peers.is_empty() && !self.confirm_leadership(term) {
                return GetResponse::failure();
            }
            // Serve only once the engine has caught up with the commit
            // point, so every acknowledged write is visible to this read.
            if !self.log.wait_applied(Duration::from_secs(1)) {
                return GetResponse::failure();
            }
        }

        match self.db.get(key) {
            Ok(Some(value)) => GetResponse::found(value),
            Ok(None) => GetResponse::not_found(),
            Err(e) => {
                tracing::warn!(error = %e, "engine read failed");
                GetResponse::failure()
            }
        }
    }

    /// One synchronous heartbeat round; true when a strict majority
    /// (counting self) acknowledged this term.
    fn confirm_leadership(&self, term: u64) -> bool {
        let request = AppendRequest {
            leader_id: self.local.id,
            term,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            commit_index: self.log.committed(),
        };

        let (tx, rx) = mpsc::channel();
        for peer in &self.peers {
            let client = Arc::clone(&peer.client);
            let request = request.clone();
            let tx = tx.clone();
            let _ = self.rpc_pool.execute(move || {
                let _ = tx.send(client.append_entries(&request));
            });
        }
        drop(tx);

        let cluster = self.peers.len() + 1;
        let mut acks = 1;
        while let Ok(result) = rx.recv() {
            if let Ok(response) = result {
                if response.term > term {
                    self.step_down(response.term);
                    return false;
                }
                if response.code == code::ACCEPTED {
                    acks += 1;
                }
            }
            if acks > cluster / 2 {
                return true;
            }
        }
        acks > cluster / 2
    }

    // ---- peer RPC handlers ----

    /// Grants the vote iff the candidate's term is current, its log is at
    /// least as long as ours, and we have not voted for anyone else this
    /// term. Receipt alone resets the election timer.
    pub fn handle_request_vote(&self, request: &VoteRequest) -> VoteResponse {
        self.touch_heartbeat();
        let mut st = self.state.lock().unwrap();

        if request.term > st.term {
            st.term = request.term;
            st.voted_for = None;
            st.leader_id = None;
            if st.role != Role::Follower {
                tracing::info!(term = st.term, "higher term in vote request, stepping down");
                st.role = Role::Follower;
            }
        }

        let granted = request.term >= st.term
            && request.last_log_index >= self.log.index()
            && (st.voted_for.is_none() || st.voted_for == Some(request.candidate_id));
        if granted {
            st.voted_for = Some(request.candidate_id);
        }
        tracing::debug!(
            candidate = request.candidate_id,
            term = request.term,
            granted,
            "processed vote request"
        );
        VoteResponse {
            term: st.term,
            code: if granted { code::OK } else { code::FAILURE },
        }
    }

    /// Accepts a batch of entries (or a bare heartbeat) from the leader.
    pub fn handle_append_entries(&self, request: &AppendRequest) -> AppendResponse {
        self.touch_heartbeat();
        {
            let mut st = self.state.lock().unwrap();
            if request.term < st.term {
                return AppendResponse {
                    term: st.term,
                    code: code::MISMATCH,
                    last_log_index: self.log.index(),
                };
            }
            if request.term > st.term {
                st.term = request.term;
                st.voted_for = None;
            }
            if st.role != Role::Follower {
                tracing::info!(
                    term = st.term,
                    leader = request.leader_id,
                    "current leader observed, stepping down"
                );
                st.role = Role::Follower;
            }
            st.leader_id = Some(request.leader_id);
        }
        self.log.update_commit(request.commit_index);

        if request.is_heartbeat() {
            return AppendResponse {
                term: request.term,
                code: code::ACCEPTED,
                last_log_index: self.log.index(),
            };
        }

        let last = self.log.index();
        if request.prev_log_index > last {
            return AppendResponse {
                term: request.term,
                code: code::MISMATCH,
                last_log_index: last,
            };
        }
        if request.prev_log_index < last {
            // Our log runs past the leader's view. Uncommitted tail
            // entries are disposable; a divergence below the commit point
            // is unreconcilable here.
            if request.prev_log_index >= self.log.committed() {
                self.log.truncate_to(request.prev_log_index);
            } else {
                return AppendResponse {
                    term: request.term,
                    code: code::LOG_AHEAD,
                    last_log_index: last,
                };
            }
        }
        if request.prev_log_index > self.log.start_index() {
            match self.log.term_at(request.prev_log_index) {
                Some(term) if term == request.prev_log_term => {}
                Some(_) => {
                    // Conflicting predecessor: drop it and make the leader
                    // back up one more step.
                    self.log.truncate_to(request.prev_log_index - 1);
                    return AppendResponse {
                        term: request.term,
                        code: code::MISMATCH,
                        last_log_index: self.log.index(),
                    };
                }
                None => {
                    return AppendResponse {
                        term: request.term,
                        code: code::MISMATCH,
                        last_log_index: self.log.index(),
                    };
                }
            }
        }

        for entry in &request.entries {
            if let Err(e) = self.log.append_entry(entry.clone()) {
                tracing::warn!(error = %e, index = entry.index, "failed to append entry");
                return AppendResponse {
                    term: request.term,
                    code: code::MISMATCH,
                    last_log_index: self.log.index(),
                };
            }
        }
        self.log.update_commit(request.commit_index);
        AppendResponse {
            term: request.term,
            code: code::ACCEPTED,
            last_log_index: self.log.index(),
        }
    }

    // ---- role transitions ----

    fn step_down(&self, new_term: u64) {
        let mut st = self.state.lock().unwrap();
        if new_term > st.term {
            st.term = new_term;
            st.voted_for = None;
            st.leader_id = None;
        }
        if st.role != Role::Follower {
            tracing::info!(term = st.term, "stepping down to follower");
            st.role = Role::Follower;
        }
    }

    fn advance_commit(&self, term: u64) {
        let cluster = self.peers.len() + 1;
        let committed = self.log.committed();
        let mut candidate = self.log.index();
        while candidate > committed {
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|peer| peer.match_index() >= candidate)
                .count();
            // Only entries of the current term commit by counting; older
            // ones commit transitively with them.
            if replicas > cluster / 2 && self.log.term_at(candidate) == Some(term) {
                self.log.update_commit(candidate);
                return;
            }
            candidate -= 1;
        }
    }

    // ---- timers and signals ----

    fn wait_timer(&self, timeout: Duration) {
        let guard = self.timer_mutex.lock().unwrap();
        let _ = self.timer_cv.wait_timeout(guard, timeout).unwrap();
    }

    fn wait_ship(&self, timeout: Duration) {
        let guard = self.ship_mutex.lock().unwrap();
        let _ = self.ship_cv.wait_timeout(guard, timeout).unwrap();
    }

    fn notify_shippers(&self) {
        self.ship_cv.notify_all();
    }

    /// Stops the timer and shipper threads, then the replicated log's
    /// apply worker. The engine's flush worker stops when the `Db` drops.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(id = self.local.id, "shutting down raft node");
        self.timer_cv.notify_all();
        self.ship_cv.notify_all();
        self.log.shutdown();
        if let Some(handle) = self.timer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let handles: Vec<_> = self.shippers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.rpc_pool.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(node: Arc<Node>) {
    let mut rng = rand::thread_rng();
    while !node.stop.load(Ordering::SeqCst) {
        if node.role() == Role::Leader {
            node.wait_timer(node.config.heartbeat_interval);
            continue;
        }

        // Randomized within [T, 1.5T] so colliding candidacies are rare.
        let base = node.config.election_timeout;
        let jitter = rng.gen_range(Duration::ZERO..=base / 2);
        let timeout = base + jitter;
        node.wait_timer(timeout);
        if node.stop.load(Ordering::SeqCst) || node.role() == Role::Leader {
            continue;
        }

        let elapsed = now_ms().saturating_sub(node.last_heartbeat_ms.load(Ordering::SeqCst));
        if elapsed < timeout.as_millis() as u64 {
            continue;
        }
        run_election(&node, &mut rng);
    }
}

fn run_election(node: &Arc<Node>, rng: &mut impl Rng) {
    let (term, last_log_index) = {
        let mut st = node.state.lock().unwrap();
        st.role = Role::Candidate;
        st.term += 1;
        st.voted_for = Some(node.local.id);
        st.leader_id = None;
        (st.term, node.log.index())
    };
    tracing::info!(term, "election timeout elapsed, campaigning");

    let request = VoteRequest {
        term,
        candidate_id: node.local.id,
        last_log_index,
    };
    let (tx, rx) = mpsc::channel();
    for peer in &node.peers {
        let client = Arc::clone(&peer.client);
        let request = request.clone();
        let tx = tx.clone();
        let peer_id = peer.id();
        let _ = node.rpc_pool.execute(move || {
            let _ = tx.send((peer_id, client.request_vote(&request)));
        });
    }
    drop(tx);

    let cluster = node.peers.len() + 1;
    let mut votes = 1;
    let mut highest_term = term;
    let deadline = Instant::now() + node.config.election_timeout;
    while votes <= cluster / 2 {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match rx.recv_timeout(deadline - now) {
            Ok((peer_id, Ok(response))) => {
                highest_term = highest_term.max(response.term);
                if response.granted() {
                    votes += 1;
                } else {
                    tracing::debug!(peer = peer_id, "vote denied");
                }
            }
            Ok((peer_id, Err(e))) => {
                tracing::debug!(peer = peer_id, error = %e, "vote request failed");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if highest_term > term {
        node.step_down(highest_term);
        return;
    }
    if votes > cluster / 2 {
        become_leader(node, term);
    } else {
        tracing::info!(term, votes, cluster, "election lost, awaiting next timeout");
        let mut st = node.state.lock().unwrap();
        if st.term == term && st.role == Role::Candidate {
            st.role = Role::Follower;
        }
    }
}

fn become_leader(node: &Arc<Node>, term: u64) {
    {
        let mut st = node.state.lock().unwrap();
        if st.term != term || st.role != Role::Candidate {
            return;
        }
        st.role = Role::Leader;
        st.leader_id = Some(node.local.id);
    }
    tracing::info!(term, peers = node.peers.len(), "won election, now leader");

    let next_index = node.log.committed() + 1;
    let mut shippers = node.shippers.lock().unwrap();
    for peer in &node.peers {
        peer.reset(next_index);
        let node = Arc::clone(node);
        let peer = Arc::clone(peer);
        shippers.push(thread::spawn(move || run_shipper(node, peer, term)));
    }
    drop(shippers);

    node.advance_commit(term);
}

fn run_shipper(node: Arc<Node>, peer: Arc<Peer>, term: u64) {
    tracing::debug!(peer = peer.id(), term, "shipper started");
    while !node.stop.load(Ordering::SeqCst) && node.is_leader_for(term) {
        let start = node.log.start_index();
        if peer.next_index() <= start {
            // The ring no longer holds that prefix; it is all committed
            // state the follower recovers from its own engine.
            peer.set_next_index(start + 1);
        }
        let next = peer.next_index();
        let last = node.log.index();

        if next > last {
            // Caught up: heartbeat cadence, woken early by new appends.
            node.wait_ship(node.config.heartbeat_interval);
            if node.stop.load(Ordering::SeqCst) || !node.is_leader_for(term) {
                break;
            }
            if peer.next_index() <= node.log.index() {
                continue;
            }
            let request = AppendRequest {
                leader_id: node.id(),
                term,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                commit_index: node.log.committed(),
            };
            match peer.client.append_entries(&request) {
                Ok(response) => {
                    peer.touch();
                    if response.term > term {
                        node.step_down(response.term);
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = peer.id(), error = %e, "heartbeat failed");
                }
            }
            continue;
        }

        let end = last.min(next + node.config.max_batch_entries as u64 - 1);
        let mut entries = Vec::with_capacity((end - next + 1) as usize);
        for index in next..=end {
            match node.log.entry_at(index) {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        if entries.is_empty() {
            // Raced with a truncation; re-derive positions.
            node.wait_ship(Duration::from_millis(10));
            continue;
        }

        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            node.log.term_at(prev_log_index).unwrap_or(0)
        };
        let shipped = entries.len() as u64;
        let request = AppendRequest {
            leader_id: node.id(),
            term,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: node.log.committed(),
        };

        match peer.client.append_entries(&request) {
            Ok(response) => {
                peer.touch();
                if response.term > term {
                    node.step_down(response.term);
                    break;
                }
                if response.code == code::ACCEPTED {
                    peer.set_next_index(next + shipped);
                    peer.set_match_index(next + shipped - 1);
                    node.advance_commit(term);
                } else {
                    // Back up, using the responder's tail as a lower hint.
                    let backed = next.saturating_sub(1).max(1);
                    let hinted = response.last_log_index.saturating_add(1);
                    peer.set_next_index(backed.min(hinted).max(1));
                    tracing::debug!(
                        peer = peer.id(),
                        next_index = peer.next_index(),
                        code = response.code,
                        "append rejected, backing up"
                    );
                }
            }
            Err(e) => {
                tracing::debug!(peer = peer.id(), error = %e, "append_entries failed");
                node.wait_ship(Duration::from_millis(100));
            }
        }
    }
    tracing::debug!(peer = peer.id(), term, "shipper exiting");
}
