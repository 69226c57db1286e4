//! Command dispatch.
//!
//! Each protocol version has its own immutable [`HandlerTable`] built once at
//! service start. Dispatching a frame runs parse → tokenize → exact-name
//! lookup → handler. Handlers never do I/O: they mutate service state and
//! queue [`Outbound`] responses, possibly for connections other than the
//! caller's (barrier and fence releases).
//!
//! # Architecture
//!
//! - **v1**: `cmd=<name> k=v ...` command handlers
//! - **v2**: `cmd=<name>;k=v;...;` command handlers

mod v1;
mod v2;

use crate::error::PmiError;
use crate::group::{BarrierRelease, DeathOutcome, FenceCompletion, ProcessGroup};
use crate::nameserv::NameService;
use crate::service::{Binding, ConnId, Outbound, ServiceConfig, ServiceState};
use crate::token::Tokens;
use crate::wire::{ProtocolVersion, Response, parse_command};

/// Handler signature: the calling connection's context and the command's
/// arguments.
pub type HandlerFn = fn(&mut Context<'_>, &Tokens) -> Result<(), PmiError>;

#[derive(Clone, Copy)]
pub struct Handler {
    pub cmd: &'static str,
    pub handler: HandlerFn,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("cmd", &self.cmd).finish()
    }
}

/// Command name → handler mapping for one protocol version.
#[derive(Debug, Clone)]
pub struct HandlerTable {
    version: ProtocolVersion,
    handlers: Vec<Handler>,
}

impl HandlerTable {
    pub fn new(version: ProtocolVersion, handlers: Vec<Handler>) -> Self {
        Self { version, handlers }
    }

    pub fn v1() -> Self {
        Self::new(ProtocolVersion::V1, v1::HANDLERS.to_vec())
    }

    pub fn v2() -> Self {
        Self::new(ProtocolVersion::V2, v2::HANDLERS.to_vec())
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Exact, case-sensitive match on the command name.
    pub fn lookup(&self, cmd: &str) -> Option<HandlerFn> {
        self.handlers
            .iter()
            .find(|h| h.cmd == cmd)
            .map(|h| h.handler)
    }

    pub fn commands(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.iter().map(|h| h.cmd)
    }
}

/// What a handler sees of the service while it runs.
pub struct Context<'a> {
    state: &'a mut ServiceState,
    outbox: &'a mut Vec<Outbound>,
    conn: ConnId,
    version: ProtocolVersion,
    cmd: &'a str,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        state: &'a mut ServiceState,
        outbox: &'a mut Vec<Outbound>,
        conn: ConnId,
        version: ProtocolVersion,
        cmd: &'a str,
    ) -> Self {
        Self {
            state,
            outbox,
            conn,
            version,
            cmd,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn cmd(&self) -> &str {
        self.cmd
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.state.config
    }

    pub fn names(&mut self) -> &mut NameService {
        &mut self.state.names
    }

    pub fn response(&self, cmd: &str) -> Response {
        Response::new(self.version, cmd)
    }

    /// Queue a response to the calling connection.
    pub fn reply(&mut self, response: Response) {
        self.outbox.push(Outbound {
            conn: self.conn,
            response,
        });
    }

    pub fn binding(&self) -> Result<Binding, PmiError> {
        self.state
            .binding(self.conn)
            .ok_or(PmiError::UnboundConnection(self.conn))
    }

    /// The caller's binding and group.
    pub fn group(&mut self) -> Result<(Binding, &mut ProcessGroup), PmiError> {
        let binding = self.binding()?;
        let group = self.state.group_mut(binding.pgid)?;
        Ok((binding, group))
    }

    /// Bind the calling connection to `pid` in group `pgid`, which must exist
    /// and have a member with that rank. A rank speaks through one open
    /// connection at a time.
    pub fn bind(&mut self, pgid: i32, pid: i32, key: &'static str) -> Result<Binding, PmiError> {
        let size = self.state.group_mut(pgid)?.size();
        if !usize::try_from(pid).is_ok_and(|rank| rank < size) {
            return Err(PmiError::InvalidValue {
                key,
                value: pid.to_string(),
            });
        }
        let binding = Binding { pgid, pid };
        if let Some(holder) = self.state.holder(binding).filter(|&c| c != self.conn) {
            return Err(PmiError::RankInUse { pid, holder });
        }
        if let Some(previous) = self.state.bind(self.conn, binding) {
            tracing::warn!(conn = %self.conn, ?previous, ?binding, "Connection rebound");
        }
        tracing::debug!(conn = %self.conn, pgid, pid, version = %self.version, "Connection bound");
        Ok(binding)
    }

    /// The caller's group together with the outbox, for handlers whose
    /// effects reach other connections.
    pub fn group_with_outbox(
        &mut self,
    ) -> Result<(Binding, &mut ProcessGroup, &mut Vec<Outbound>), PmiError> {
        let binding = self.binding()?;
        let group = self.state.group_mut(binding.pgid)?;
        Ok((binding, group, &mut *self.outbox))
    }

    /// Mark the caller's process dead and queue whatever that unblocks.
    pub fn mark_caller_dead(&mut self) -> Result<Binding, PmiError> {
        let (binding, group, outbox) = self.group_with_outbox()?;
        let outcome = group.mark_dead(binding.pid);
        notify_death(group, outcome, outbox);
        Ok(binding)
    }
}

/// Run one frame body through `table` on behalf of `conn`.
pub(crate) fn dispatch(
    table: &HandlerTable,
    state: &mut ServiceState,
    conn: ConnId,
    body: &[u8],
    outbox: &mut Vec<Outbound>,
) -> Result<(), PmiError> {
    let parsed = parse_command(body, table.version())?;
    let handler = table
        .lookup(&parsed.name)
        .ok_or_else(|| PmiError::UnknownCommand(parsed.name.clone()))?;
    let tokens = Tokens::from_args(&parsed.args);
    tracing::debug!(
        %conn,
        version = %table.version(),
        cmd = %parsed.name,
        args = tokens.len(),
        "Dispatching command"
    );

    let mut ctx = Context::new(state, outbox, conn, table.version(), &parsed.name);
    handler(&mut ctx, &tokens)
}

/// Response sent back when a command fails outright.
pub fn error_response(version: ProtocolVersion, err: &PmiError) -> Response {
    let text = err.to_string();
    match version {
        // Fields are space-delimited in v1.
        ProtocolVersion::V1 => Response::new(version, "error")
            .rc(-1)
            .arg("msg", text.replace(char::is_whitespace, "_")),
        ProtocolVersion::V2 => Response::new(version, "error")
            .rc(-1)
            .arg("errmsg", text.replace(';', ",")),
    }
}

/// Queue `barrier_out` for every released waiter.
pub(crate) fn notify_barrier(
    group: &mut ProcessGroup,
    release: BarrierRelease,
    outbox: &mut Vec<Outbound>,
) {
    distribute_keyvals(group);
    outbox.extend(release.waiters.into_iter().map(|w| Outbound {
        conn: w.conn,
        response: Response::new(ProtocolVersion::V1, "barrier_out"),
    }));
}

/// Queue a fence completion notice for every member of the finished epoch.
pub(crate) fn notify_fence(
    group: &mut ProcessGroup,
    completion: FenceCompletion,
    outbox: &mut Vec<Outbound>,
) {
    distribute_keyvals(group);
    outbox.extend(completion.members.into_iter().map(|m| Outbound {
        conn: m.conn,
        response: Response::new(ProtocolVersion::V2, "kvs-fence-response").rc(0),
    }));
}

pub(crate) fn notify_death(
    group: &mut ProcessGroup,
    outcome: DeathOutcome,
    outbox: &mut Vec<Outbound>,
) {
    if let Some(release) = outcome.barrier {
        notify_barrier(group, release, outbox);
    }
    if let Some(completion) = outcome.fence {
        notify_fence(group, completion, outbox);
    }
}

/// Publish everything written before a barrier or fence release.
///
/// Workers read the central KVS directly, so there is no cache to push pairs
/// into. Only the watermark moves; it shows up in group snapshots as the
/// number of pairs visible as of the last completed synchronization.
fn distribute_keyvals(group: &mut ProcessGroup) {
    let fresh = group.mark_keyvals_distributed();
    tracing::debug!(
        pgid = group.pgid(),
        fresh,
        total = group.kvs().len(),
        "Keyvals distributed"
    );
}
