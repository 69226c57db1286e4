//! PmiService: transport-agnostic rendezvous state and command handling.
//!
//! This service owns:
//! - Process groups (KVS, barrier, fence, dead-process bookkeeping)
//! - Connection bindings (which connection speaks for which rank)
//! - The launcher-wide name service
//! - The v1 and v2 handler tables
//!
//! It does no I/O. The transport feeds it decoded frames and connection
//! closures one at a time and delivers the [`Outbound`] responses it returns.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::dispatch::{self, HandlerTable, error_response, notify_death};
use crate::error::{FrameError, PmiError};
use crate::group::{GroupSnapshot, Pgid, Pid, ProcessGroup};
use crate::nameserv::NameService;
use crate::wire::{Frame, ProtocolVersion, Response};

/// Group that `initack`/`fullinit` bind into.
pub const DEFAULT_PGID: Pgid = 0;

/// Opaque identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The rank a connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub pgid: Pgid,
    pub pid: Pid,
}

/// Service configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Reject repeated KVS keys instead of appending them.
    pub strict_keys: bool,
    /// Reported universe size. Defaults to the caller's group size.
    pub universe_size: Option<usize>,
    pub appnum: i32,
    /// Reported to clients as the debug flag.
    pub debug: bool,
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject repeated keys in every group's KVS.
    pub fn with_strict_keys(mut self, strict: bool) -> Self {
        self.strict_keys = strict;
        self
    }

    /// Override the universe size reported to workers.
    pub fn with_universe_size(mut self, size: usize) -> Self {
        self.universe_size = Some(size);
        self
    }

    /// Set the application number reported to workers.
    pub fn with_appnum(mut self, appnum: i32) -> Self {
        self.appnum = appnum;
        self
    }

    /// Report the job as being debugged.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// A response addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub conn: ConnId,
    pub response: Response,
}

/// Everything handlers may read or mutate.
#[derive(Debug)]
pub(crate) struct ServiceState {
    pub(crate) config: ServiceConfig,
    pub(crate) groups: HashMap<Pgid, ProcessGroup>,
    pub(crate) bindings: HashMap<ConnId, Binding>,
    pub(crate) names: NameService,
}

impl ServiceState {
    pub(crate) fn binding(&self, conn: ConnId) -> Option<Binding> {
        self.bindings.get(&conn).copied()
    }

    /// The open connection bound to `binding`, if any.
    pub(crate) fn holder(&self, binding: Binding) -> Option<ConnId> {
        self.bindings
            .iter()
            .find_map(|(&conn, &b)| (b == binding).then_some(conn))
    }

    /// Bind `conn`, returning its previous binding.
    pub(crate) fn bind(&mut self, conn: ConnId, binding: Binding) -> Option<Binding> {
        self.bindings.insert(conn, binding)
    }

    pub(crate) fn group_mut(&mut self, pgid: Pgid) -> Result<&mut ProcessGroup, PmiError> {
        self.groups
            .get_mut(&pgid)
            .ok_or(PmiError::UnknownGroup(pgid))
    }
}

/// The rendezvous service.
pub struct PmiService {
    v1: HandlerTable,
    v2: HandlerTable,
    state: ServiceState,
}

impl PmiService {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_tables(config, HandlerTable::v1(), HandlerTable::v2())
    }

    /// Use explicit handler tables instead of the built-in ones.
    pub fn with_tables(config: ServiceConfig, v1: HandlerTable, v2: HandlerTable) -> Self {
        Self {
            v1,
            v2,
            state: ServiceState {
                config,
                groups: HashMap::new(),
                bindings: HashMap::new(),
                names: NameService::new(),
            },
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.state.config
    }

    /// Create group `pgid` with `size` members and a fresh KVS.
    pub fn create_group(&mut self, pgid: Pgid, size: usize) -> Result<&ProcessGroup, PmiError> {
        if self.state.groups.contains_key(&pgid) {
            return Err(PmiError::GroupExists(pgid));
        }
        let group = ProcessGroup::create(pgid, size, self.state.config.strict_keys)?;
        tracing::info!(pgid, size, kvsname = %group.kvs().name(), "Process group created");
        Ok(self.state.groups.entry(pgid).or_insert(group))
    }

    /// Add an already-built group.
    pub fn insert_group(&mut self, group: ProcessGroup) -> Result<(), PmiError> {
        let pgid = group.pgid();
        if self.state.groups.contains_key(&pgid) {
            return Err(PmiError::GroupExists(pgid));
        }
        self.state.groups.insert(pgid, group);
        Ok(())
    }

    /// Tear down a group with its KVS and fence records, and unbind every
    /// connection bound into it.
    pub fn destroy_group(&mut self, pgid: Pgid) -> Result<ProcessGroup, PmiError> {
        let group = self
            .state
            .groups
            .remove(&pgid)
            .ok_or(PmiError::UnknownGroup(pgid))?;
        self.state.bindings.retain(|_, b| b.pgid != pgid);
        tracing::info!(pgid, kvsname = %group.kvs().name(), "Process group destroyed");
        Ok(group)
    }

    pub fn group(&self, pgid: Pgid) -> Option<&ProcessGroup> {
        self.state.groups.get(&pgid)
    }

    pub fn binding(&self, conn: ConnId) -> Option<Binding> {
        self.state.binding(conn)
    }

    pub fn names(&self) -> &NameService {
        &self.state.names
    }

    pub fn table(&self, version: ProtocolVersion) -> &HandlerTable {
        match version {
            ProtocolVersion::V1 => &self.v1,
            ProtocolVersion::V2 => &self.v2,
        }
    }

    /// Run one decoded frame from `conn` and collect the responses.
    ///
    /// A command that fails produces an error response to `conn` and leaves
    /// the rest of the service untouched.
    pub fn handle_frame(&mut self, conn: ConnId, frame: &Frame) -> Vec<Outbound> {
        let mut outbox = Vec::new();
        let table = match frame.version {
            ProtocolVersion::V1 => &self.v1,
            ProtocolVersion::V2 => &self.v2,
        };
        if let Err(err) = dispatch::dispatch(table, &mut self.state, conn, &frame.body, &mut outbox)
        {
            tracing::warn!(%conn, version = %frame.version, error = %err, "Command failed");
            outbox.push(Outbound {
                conn,
                response: error_response(frame.version, &err),
            });
        }
        outbox
    }

    /// Answer a frame the codec could not deliver.
    ///
    /// Only the caller hears about it. Whether the connection survives is up
    /// to the transport.
    pub fn reject_frame(
        &self,
        conn: ConnId,
        version: ProtocolVersion,
        error: FrameError,
    ) -> Vec<Outbound> {
        let err = PmiError::from(error);
        tracing::warn!(%conn, %version, error = %err, "Frame rejected");
        vec![Outbound {
            conn,
            response: error_response(version, &err),
        }]
    }

    /// Handle a connection that went away.
    ///
    /// The rank it was bound to is marked dead so barriers and fences can
    /// still complete, and its fence records are dropped.
    pub fn connection_lost(&mut self, conn: ConnId) -> Vec<Outbound> {
        let mut outbox = Vec::new();
        let Some(binding) = self.state.bindings.remove(&conn) else {
            tracing::debug!(%conn, "Unbound connection closed");
            return outbox;
        };
        let Some(group) = self.state.groups.get_mut(&binding.pgid) else {
            return outbox;
        };

        if !group.is_dead(binding.pid) {
            let err = PmiError::ConnectionLost(conn);
            tracing::warn!(pgid = binding.pgid, pid = binding.pid, error = %err, "Marking process dead");
        }
        let outcome = group.mark_dead(binding.pid);
        group.forget_connection(conn);
        notify_death(group, outcome, &mut outbox);
        outbox
    }

    /// True when group `pgid` exists and all its members have exited.
    pub fn is_group_complete(&self, pgid: Pgid) -> bool {
        self.group(pgid).is_some_and(ProcessGroup::is_complete)
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let mut groups: Vec<_> = self.state.groups.values().map(ProcessGroup::snapshot).collect();
        groups.sort_by_key(|g| g.pgid);
        ServiceSnapshot {
            groups,
            connections: self.state.bindings.len(),
            published_names: self.state.names.len(),
        }
    }
}

/// Point-in-time view of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub groups: Vec<GroupSnapshot>,
    pub connections: usize,
    pub published_names: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvs::Kvs;

    fn service(size: usize) -> PmiService {
        let mut svc = PmiService::new(ServiceConfig::new());
        svc.insert_group(ProcessGroup::with_kvs(
            DEFAULT_PGID,
            size,
            Kvs::with_name("kvs_test", false),
        ))
        .unwrap();
        svc
    }

    fn v1(svc: &mut PmiService, conn: u64, line: &str) -> Vec<String> {
        let frame = Frame::new(ProtocolVersion::V1, format!("{line}\n"));
        wire(svc.handle_frame(ConnId::new(conn), &frame))
    }

    fn v2(svc: &mut PmiService, conn: u64, body: &str) -> Vec<String> {
        let frame = Frame::new(ProtocolVersion::V2, body.to_string());
        wire(svc.handle_frame(ConnId::new(conn), &frame))
    }

    /// Render outbound responses as `<conn>: <body>`.
    fn wire(out: Vec<Outbound>) -> Vec<String> {
        out.into_iter()
            .map(|o| format!("{}: {}", o.conn, o.response))
            .collect()
    }

    #[test]
    fn v1_init_handshake() {
        let mut svc = service(2);
        assert_eq!(
            v1(&mut svc, 1, "cmd=init pmi_version=1 pmi_subversion=1"),
            vec!["1: cmd=response_to_init pmi_version=1 pmi_subversion=1 rc=0"]
        );
        assert_eq!(
            v1(&mut svc, 1, "cmd=initack pmiid=1"),
            vec![
                "1: cmd=initack",
                "1: cmd=set size=2",
                "1: cmd=set rank=1",
                "1: cmd=set debug=0",
            ]
        );
        assert_eq!(
            svc.binding(ConnId::new(1)),
            Some(Binding {
                pgid: DEFAULT_PGID,
                pid: 1
            })
        );
    }

    #[test]
    fn v1_init_rejects_other_major_versions() {
        let mut svc = service(1);
        assert_eq!(
            v1(&mut svc, 1, "cmd=init pmi_version=2 pmi_subversion=0"),
            vec!["1: cmd=response_to_init pmi_version=1 pmi_subversion=1 rc=-1"]
        );
    }

    #[test]
    fn v1_get_maxes_works_unbound() {
        let mut svc = service(1);
        insta::assert_snapshot!(v1(&mut svc, 1, "cmd=get_maxes").join("\n"), @"1: cmd=maxes kvsname_max=256 keylen_max=64 vallen_max=1024");
    }

    #[test]
    fn v1_put_get_round_trip() {
        let mut svc = service(1);
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        assert_eq!(
            v1(&mut svc, 1, "cmd=put kvsname=kvs_test key=addr value=tcp://n0:5000"),
            vec!["1: cmd=put_result rc=0 msg=success"]
        );
        assert_eq!(
            v1(&mut svc, 1, "cmd=get kvsname=kvs_test key=addr"),
            vec!["1: cmd=get_result rc=0 msg=success value=tcp://n0:5000"]
        );
        assert_eq!(
            v1(&mut svc, 1, "cmd=get kvsname=kvs_test key=nope"),
            vec!["1: cmd=get_result rc=-1 msg=key_nope_not_found value=unknown"]
        );
    }

    #[test]
    fn v1_put_to_wrong_namespace_fails() {
        let mut svc = service(1);
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        let out = v1(&mut svc, 1, "cmd=put kvsname=other key=a value=1");
        assert!(out[0].starts_with("1: cmd=error rc=-1 msg="), "{out:?}");
        assert!(svc.group(DEFAULT_PGID).unwrap().kvs().is_empty());
    }

    #[test]
    fn v1_strict_put_reports_duplicate_in_band() {
        let mut svc = PmiService::new(ServiceConfig::new().with_strict_keys(true));
        svc.insert_group(ProcessGroup::with_kvs(0, 1, Kvs::with_name("kvs_test", true)))
            .unwrap();
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        v1(&mut svc, 1, "cmd=put key=a value=1");
        assert_eq!(
            v1(&mut svc, 1, "cmd=put key=a value=2"),
            vec!["1: cmd=put_result rc=-1 msg=duplicate_key_a"]
        );
    }

    #[test]
    fn v1_barrier_releases_every_waiter() {
        let mut svc = service(3);
        for (conn, rank) in [(10, 0), (11, 1), (12, 2)] {
            v1(&mut svc, conn, &format!("cmd=initack pmiid={rank}"));
        }
        assert!(v1(&mut svc, 10, "cmd=barrier_in").is_empty());
        assert!(v1(&mut svc, 11, "cmd=barrier_in").is_empty());
        assert_eq!(
            v1(&mut svc, 12, "cmd=barrier_in"),
            vec![
                "10: cmd=barrier_out",
                "11: cmd=barrier_out",
                "12: cmd=barrier_out",
            ]
        );
        assert_eq!(svc.group(DEFAULT_PGID).unwrap().barrier_count(), 0);
    }

    #[test]
    fn barrier_release_advances_keyval_distribution() {
        let mut svc = service(1);
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        v1(&mut svc, 1, "cmd=put key=a value=1");
        v1(&mut svc, 1, "cmd=barrier_in");
        let group = svc.group(DEFAULT_PGID).unwrap();
        assert_eq!(group.keyval_dist_count(), 1);
        assert!(group.undistributed_keyvals().is_empty());
    }

    #[test]
    fn fence_completion_publishes_keyvals_in_snapshot() {
        let mut svc = service(2);
        v2(&mut svc, 1, "cmd=fullinit;pmirank=0;");
        v2(&mut svc, 2, "cmd=fullinit;pmirank=1;");
        v2(&mut svc, 1, "cmd=kvs-put;key=a;value=1;");
        v2(&mut svc, 2, "cmd=kvs-put;key=b;value=2;");
        v2(&mut svc, 1, "cmd=kvs-fence;");
        assert_eq!(svc.snapshot().groups[0].keyval_dist_count, 0);

        v2(&mut svc, 2, "cmd=kvs-fence;");
        // Written after the fence, so not yet part of any completed epoch.
        v2(&mut svc, 1, "cmd=kvs-put;key=c;value=3;");
        let snap = &svc.snapshot().groups[0];
        assert_eq!(snap.keyvals, 3);
        assert_eq!(snap.keyval_dist_count, 2);
    }

    #[test]
    fn rejected_frame_gets_a_protocol_error_reply() {
        let svc = service(1);
        let err = FrameError::TooLong { len: 90, max: 64 };
        assert_eq!(
            wire(svc.reject_frame(ConnId::new(4), ProtocolVersion::V1, err)),
            vec!["4: cmd=error rc=-1 msg=malformed_frame:_frame_of_90_bytes_exceeds_limit_of_64_bytes"]
        );
        let err = FrameError::BadLength("00x014".to_string());
        assert_eq!(
            wire(svc.reject_frame(ConnId::new(4), ProtocolVersion::V2, err)),
            vec!["4: cmd=error;rc=-1;errmsg=malformed frame: bad frame length field: 00x014;"]
        );
    }

    #[test]
    fn lost_connection_releases_barrier() {
        let mut svc = service(2);
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        v1(&mut svc, 2, "cmd=initack pmiid=1");
        v1(&mut svc, 1, "cmd=barrier_in");

        let out = wire(svc.connection_lost(ConnId::new(2)));
        assert_eq!(out, vec!["1: cmd=barrier_out"]);
        assert!(svc.binding(ConnId::new(2)).is_none());
        assert!(svc.group(DEFAULT_PGID).unwrap().is_dead(1));
    }

    #[test]
    fn unbound_connection_cannot_touch_group_state() {
        let mut svc = service(1);
        assert_eq!(
            v1(&mut svc, 1, "cmd=barrier_in"),
            vec!["1: cmd=error rc=-1 msg=connection_1_is_not_bound_to_a_process_group"]
        );
        assert!(svc.connection_lost(ConnId::new(1)).is_empty());
    }

    #[test]
    fn unknown_command_is_not_fatal() {
        let mut svc = service(1);
        assert_eq!(
            v1(&mut svc, 1, "cmd=frobnicate"),
            vec!["1: cmd=error rc=-1 msg=unknown_command_`frobnicate`"]
        );
        assert_eq!(v1(&mut svc, 1, "cmd=get_maxes").len(), 1);
    }

    #[test]
    fn initack_rejects_rank_outside_group() {
        let mut svc = service(2);
        let out = v1(&mut svc, 1, "cmd=initack pmiid=2");
        assert!(out[0].starts_with("1: cmd=error"), "{out:?}");
        assert!(svc.binding(ConnId::new(1)).is_none());
    }

    #[test]
    fn v1_name_service() {
        let mut svc = service(1);
        assert_eq!(
            v1(&mut svc, 1, "cmd=publish_name service=ocean port=4711"),
            vec!["1: cmd=publish_result rc=0 msg=success"]
        );
        assert_eq!(
            v1(&mut svc, 2, "cmd=publish_name service=ocean port=4712"),
            vec!["2: cmd=publish_result rc=-1 msg=service_ocean_already_published"]
        );
        assert_eq!(
            v1(&mut svc, 2, "cmd=lookup_name service=ocean"),
            vec!["2: cmd=lookup_result rc=0 msg=success port=4711"]
        );
        assert_eq!(
            v1(&mut svc, 1, "cmd=unpublish_name service=ocean"),
            vec!["1: cmd=unpublish_result rc=0 msg=success"]
        );
        assert_eq!(
            v1(&mut svc, 2, "cmd=lookup_name service=ocean"),
            vec!["2: cmd=lookup_result rc=-1 msg=service_ocean_not_found"]
        );
    }

    #[test]
    fn v1_finalize_marks_process_dead() {
        let mut svc = service(2);
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        assert_eq!(v1(&mut svc, 1, "cmd=finalize"), vec!["1: cmd=finalize_ack"]);
        assert!(svc.group(DEFAULT_PGID).unwrap().is_dead(0));
        assert!(!svc.is_group_complete(DEFAULT_PGID));

        v1(&mut svc, 2, "cmd=initack pmiid=1");
        assert!(v1(&mut svc, 2, "cmd=abort exitcode=1 message=boom").is_empty());
        assert!(svc.is_group_complete(DEFAULT_PGID));
    }

    #[test]
    fn finalized_rank_cannot_reenter_barrier() {
        let mut svc = service(3);
        for (conn, rank) in [(1, 0), (2, 1), (3, 2)] {
            v1(&mut svc, conn, &format!("cmd=initack pmiid={rank}"));
        }
        v1(&mut svc, 1, "cmd=finalize");
        assert_eq!(
            v1(&mut svc, 1, "cmd=barrier_in"),
            vec!["1: cmd=error rc=-1 msg=process_0_in_group_0_already_exited"]
        );
        assert!(v1(&mut svc, 2, "cmd=barrier_in").is_empty());
        assert_eq!(
            v1(&mut svc, 3, "cmd=barrier_in"),
            vec!["2: cmd=barrier_out", "3: cmd=barrier_out"]
        );
    }

    #[test]
    fn finalized_rank_cannot_reenter_fence() {
        let mut svc = service(3);
        for (conn, rank) in [(1, 0), (2, 1), (3, 2)] {
            v2(&mut svc, conn, &format!("cmd=fullinit;pmirank={rank};"));
        }
        v2(&mut svc, 1, "cmd=finalize;");
        assert_eq!(
            v2(&mut svc, 1, "cmd=kvs-fence;"),
            vec!["1: cmd=error;rc=-1;errmsg=process 0 in group 0 already exited;"]
        );
        assert!(v2(&mut svc, 2, "cmd=kvs-fence;").is_empty());
        assert_eq!(svc.group(DEFAULT_PGID).unwrap().epoch(), 0);
        assert_eq!(
            v2(&mut svc, 3, "cmd=kvs-fence;"),
            vec![
                "2: cmd=kvs-fence-response;rc=0;",
                "3: cmd=kvs-fence-response;rc=0;",
            ]
        );
    }

    #[test]
    fn rank_bound_to_another_connection_is_rejected() {
        let mut svc = service(2);
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        assert_eq!(
            v1(&mut svc, 2, "cmd=initack pmiid=0"),
            vec!["2: cmd=error rc=-1 msg=rank_0_is_already_bound_to_connection_1"]
        );
        assert!(svc.binding(ConnId::new(2)).is_none());

        // The holder may repeat its own handshake.
        assert_eq!(v1(&mut svc, 1, "cmd=initack pmiid=0").len(), 4);

        // An unbound connection cannot stand in at the barrier.
        assert!(v1(&mut svc, 1, "cmd=barrier_in").is_empty());
        assert!(v1(&mut svc, 2, "cmd=barrier_in")[0].starts_with("2: cmd=error"));
        assert_eq!(svc.group(DEFAULT_PGID).unwrap().barrier_count(), 1);
    }

    #[test]
    fn repeated_barrier_entry_is_rejected() {
        let mut svc = service(2);
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        v1(&mut svc, 1, "cmd=barrier_in");
        assert_eq!(
            v1(&mut svc, 1, "cmd=barrier_in"),
            vec!["1: cmd=error rc=-1 msg=process_0_is_already_waiting_in_the_barrier"]
        );
        assert_eq!(svc.group(DEFAULT_PGID).unwrap().barrier_count(), 1);
    }

    #[test]
    fn v2_fullinit_reports_job() {
        let mut svc = PmiService::new(ServiceConfig::new().with_appnum(3));
        svc.insert_group(ProcessGroup::with_kvs(0, 4, Kvs::with_name("kvs_test", false)))
            .unwrap();
        insta::assert_snapshot!(v2(&mut svc, 1, "cmd=fullinit;pmirank=2;").join("\n"), @"1: cmd=fullinit-response;pmi-version=2;pmi-subversion=0;rank=2;size=4;appnum=3;spawner-jobid=kvs_test;debugged=FALSE;pmiverbose=FALSE;rc=0;");
    }

    #[test]
    fn v2_kvs_and_fence() {
        let mut svc = service(2);
        v2(&mut svc, 1, "cmd=fullinit;pmirank=0;");
        v2(&mut svc, 2, "cmd=fullinit;pmirank=1;");

        assert_eq!(
            v2(&mut svc, 1, "cmd=kvs-put;key=bc-0;value=port#1;"),
            vec!["1: cmd=kvs-put-response;rc=0;"]
        );
        assert!(v2(&mut svc, 1, "cmd=kvs-fence;").is_empty());
        // Re-entering the same epoch does not count twice.
        assert!(v2(&mut svc, 1, "cmd=kvs-fence;").is_empty());
        assert_eq!(
            v2(&mut svc, 2, "cmd=kvs-fence;"),
            vec![
                "1: cmd=kvs-fence-response;rc=0;",
                "2: cmd=kvs-fence-response;rc=0;",
            ]
        );
        assert_eq!(svc.group(DEFAULT_PGID).unwrap().epoch(), 1);

        assert_eq!(
            v2(&mut svc, 2, "cmd=kvs-get;jobid=kvs_test;key=bc-0;"),
            vec!["2: cmd=kvs-get-response;found=TRUE;value=port#1;rc=0;"]
        );
        assert_eq!(
            v2(&mut svc, 2, "cmd=kvs-get;key=bc-9;"),
            vec!["2: cmd=kvs-get-response;found=FALSE;rc=0;"]
        );
    }

    #[test]
    fn v2_job_attributes() {
        let mut svc = PmiService::new(ServiceConfig::new().with_universe_size(16));
        svc.insert_group(ProcessGroup::with_kvs(0, 1, Kvs::with_name("kvs_test", false)))
            .unwrap();
        v2(&mut svc, 1, "cmd=fullinit;pmirank=0;");
        assert_eq!(
            v2(&mut svc, 1, "cmd=job-getid;"),
            vec!["1: cmd=job-getid-response;jobid=kvs_test;rc=0;"]
        );
        assert_eq!(
            v2(&mut svc, 1, "cmd=info-getjobattr;key=universeSize;"),
            vec!["1: cmd=info-getjobattr-response;found=TRUE;value=16;rc=0;"]
        );
        assert_eq!(
            v2(&mut svc, 1, "cmd=info-getjobattr;key=PMI_mapping;"),
            vec!["1: cmd=info-getjobattr-response;found=FALSE;rc=0;"]
        );
    }

    #[test]
    fn v2_name_service() {
        let mut svc = service(1);
        assert_eq!(
            v2(&mut svc, 1, "cmd=name-publish;name=ocean;port=4711;"),
            vec!["1: cmd=name-publish-response;rc=0;"]
        );
        assert_eq!(
            v2(&mut svc, 1, "cmd=name-lookup;name=ocean;"),
            vec!["1: cmd=name-lookup-response;port=4711;found=TRUE;rc=0;"]
        );
        assert_eq!(
            v2(&mut svc, 1, "cmd=name-unpublish;name=sky;"),
            vec!["1: cmd=name-unpublish-response;rc=-1;errmsg=service sky is not published;"]
        );
    }

    #[test]
    fn v2_finalize_completes_pending_fence() {
        let mut svc = service(2);
        v2(&mut svc, 1, "cmd=fullinit;pmirank=0;");
        v2(&mut svc, 2, "cmd=fullinit;pmirank=1;");
        v2(&mut svc, 1, "cmd=kvs-fence;");
        assert_eq!(
            v2(&mut svc, 2, "cmd=finalize;"),
            vec![
                "1: cmd=kvs-fence-response;rc=0;",
                "2: cmd=finalize-response;rc=0;",
            ]
        );
    }

    #[test]
    fn v2_errors_use_errmsg() {
        let mut svc = service(1);
        assert_eq!(
            v2(&mut svc, 1, "cmd=kvs-get;"),
            vec!["1: cmd=error;rc=-1;errmsg=command `kvs-get` is missing required key `key`;"]
        );
    }

    #[test]
    fn group_lifecycle() {
        let mut svc = PmiService::new(ServiceConfig::new());
        let name = svc.create_group(7, 2).unwrap().kvs().name().to_string();
        assert!(name.starts_with(&format!("kvs_{}_7_", std::process::id())));
        assert!(matches!(
            svc.create_group(7, 2),
            Err(PmiError::GroupExists(7))
        ));

        svc.insert_group(ProcessGroup::with_kvs(0, 1, Kvs::with_name("kvs_test", false)))
            .unwrap();
        v1(&mut svc, 1, "cmd=initack pmiid=0");
        svc.destroy_group(0).unwrap();
        assert!(svc.binding(ConnId::new(1)).is_none());
        assert!(matches!(
            svc.destroy_group(0),
            Err(PmiError::UnknownGroup(0))
        ));
    }

    #[test]
    fn snapshot_lists_groups_in_order() {
        let mut svc = service(1);
        svc.insert_group(ProcessGroup::with_kvs(3, 2, Kvs::with_name("kvs_three", false)))
            .unwrap();
        let snap = svc.snapshot();
        let pgids: Vec<_> = snap.groups.iter().map(|g| g.pgid).collect();
        assert_eq!(pgids, vec![0, 3]);
        assert_eq!(snap.connections, 0);
    }
}
