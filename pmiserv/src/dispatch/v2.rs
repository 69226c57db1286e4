//! Version 2 command handlers.

use super::{Context, Handler, notify_fence};
use crate::error::{KvsError, PmiError};
use crate::group::FenceOutcome;
use crate::service::DEFAULT_PGID;
use crate::token::Tokens;
use crate::wire::Response;

pub(super) const HANDLERS: &[Handler] = &[
    Handler { cmd: "fullinit", handler: fullinit },
    Handler { cmd: "job-getid", handler: job_getid },
    Handler { cmd: "info-getjobattr", handler: info_getjobattr },
    Handler { cmd: "kvs-put", handler: kvs_put },
    Handler { cmd: "kvs-get", handler: kvs_get },
    Handler { cmd: "kvs-fence", handler: kvs_fence },
    Handler { cmd: "name-publish", handler: name_publish },
    Handler { cmd: "name-unpublish", handler: name_unpublish },
    Handler { cmd: "name-lookup", handler: name_lookup },
    Handler { cmd: "abort", handler: abort },
    Handler { cmd: "finalize", handler: finalize },
];

const TRUE: &str = "TRUE";
const FALSE: &str = "FALSE";

fn fullinit(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    // Older clients send `pmiid` instead of `pmirank`.
    let pid: i32 = match tokens.find_parsed("pmirank")? {
        Some(pid) => pid,
        None => tokens
            .find_parsed("pmiid")?
            .ok_or_else(|| PmiError::MissingKey {
                cmd: ctx.cmd().to_string(),
                key: "pmirank",
            })?,
    };
    ctx.bind(DEFAULT_PGID, pid, "pmirank")?;

    let (_, group) = ctx.group()?;
    let size = group.size();
    let jobid = group.kvs().name().to_string();
    let appnum = ctx.config().appnum;
    let debugged = if ctx.config().debug { TRUE } else { FALSE };

    let resp = ctx
        .response("fullinit-response")
        .arg("pmi-version", 2)
        .arg("pmi-subversion", 0)
        .arg("rank", pid)
        .arg("size", size)
        .arg("appnum", appnum)
        .arg("spawner-jobid", jobid)
        .arg("debugged", debugged)
        .arg("pmiverbose", debugged)
        .rc(0);
    ctx.reply(resp);
    Ok(())
}

fn job_getid(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let (_, group) = ctx.group()?;
    let jobid = group.kvs().name().to_string();
    let resp = ctx.response("job-getid-response").arg("jobid", jobid).rc(0);
    ctx.reply(resp);
    Ok(())
}

fn info_getjobattr(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let key = tokens.require(ctx.cmd(), "key")?;
    let universe_size = ctx.config().universe_size;
    let appnum = ctx.config().appnum;
    let (_, group) = ctx.group()?;
    let value = match key {
        "universeSize" => Some(universe_size.unwrap_or(group.size()).to_string()),
        "appnum" => Some(appnum.to_string()),
        _ => group.kvs().get(key).map(str::to_string),
    };
    let resp = found_response(ctx, "info-getjobattr-response", value);
    ctx.reply(resp);
    Ok(())
}

fn kvs_put(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let key = tokens.require(ctx.cmd(), "key")?;
    let value = tokens.require(ctx.cmd(), "value")?;

    let (binding, group) = ctx.group()?;
    let resp = match group.kvs_mut().put(key, value) {
        Ok(()) => {
            tracing::trace!(pgid = binding.pgid, pid = binding.pid, key, "Put");
            ctx.response("kvs-put-response").rc(0)
        }
        Err(e @ KvsError::DuplicateKey(_)) => ctx
            .response("kvs-put-response")
            .rc(-1)
            .arg("errmsg", e),
        Err(e) => return Err(e.into()),
    };
    ctx.reply(resp);
    Ok(())
}

fn kvs_get(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let key = tokens.require(ctx.cmd(), "key")?;
    let (_, group) = ctx.group()?;
    let value = group.kvs().get(key).map(str::to_string);
    let resp = found_response(ctx, "kvs-get-response", value);
    ctx.reply(resp);
    Ok(())
}

fn kvs_fence(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let conn = ctx.conn();
    let (binding, group, outbox) = ctx.group_with_outbox()?;
    let epoch = group.epoch();
    match group.enter_fence(conn, binding.pid, epoch) {
        FenceOutcome::Completed(completion) => notify_fence(group, completion, outbox),
        FenceOutcome::Pending { count, needed } => {
            tracing::trace!(%conn, pid = binding.pid, epoch, count, needed, "Fence pending");
        }
        outcome @ (FenceOutcome::Duplicate | FenceOutcome::WrongEpoch { .. }) => {
            tracing::debug!(%conn, pid = binding.pid, epoch, ?outcome, "Ignoring repeated fence");
        }
        FenceOutcome::Exited => {
            return Err(PmiError::ProcessExited {
                pgid: binding.pgid,
                pid: binding.pid,
            });
        }
    }
    Ok(())
}

fn name_publish(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let name = tokens.require(ctx.cmd(), "name")?;
    let port = tokens.require(ctx.cmd(), "port")?;
    let result = ctx.names().publish(name, port);
    let resp = rc_response(ctx, "name-publish-response", result);
    ctx.reply(resp);
    Ok(())
}

fn name_unpublish(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let name = tokens.require(ctx.cmd(), "name")?;
    let result = ctx.names().unpublish(name);
    let resp = rc_response(ctx, "name-unpublish-response", result);
    ctx.reply(resp);
    Ok(())
}

fn name_lookup(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let name = tokens.require(ctx.cmd(), "name")?;
    let resp = match ctx.names().lookup(name).map(str::to_string) {
        Ok(port) => ctx
            .response("name-lookup-response")
            .arg("port", port)
            .arg("found", TRUE)
            .rc(0),
        Err(_) => ctx.response("name-lookup-response").arg("found", FALSE).rc(0),
    };
    ctx.reply(resp);
    Ok(())
}

fn abort(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let binding = ctx.mark_caller_dead()?;
    tracing::warn!(
        conn = %ctx.conn(),
        pgid = binding.pgid,
        pid = binding.pid,
        message = tokens.find("msg").unwrap_or(""),
        "Process aborted"
    );
    Ok(())
}

fn finalize(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let binding = ctx.mark_caller_dead()?;
    tracing::debug!(conn = %ctx.conn(), pgid = binding.pgid, pid = binding.pid, "Process finalized");
    let resp = ctx.response("finalize-response").rc(0);
    ctx.reply(resp);
    Ok(())
}

fn found_response(ctx: &Context<'_>, cmd: &str, value: Option<String>) -> Response {
    match value {
        Some(value) => ctx
            .response(cmd)
            .arg("found", TRUE)
            .arg("value", value)
            .rc(0),
        None => ctx.response(cmd).arg("found", FALSE).rc(0),
    }
}

fn rc_response<E: std::fmt::Display>(
    ctx: &Context<'_>,
    cmd: &str,
    result: Result<(), E>,
) -> Response {
    match result {
        Ok(()) => ctx.response(cmd).rc(0),
        Err(e) => ctx.response(cmd).rc(-1).arg("errmsg", e),
    }
}
