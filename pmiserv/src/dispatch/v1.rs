//! Version 1 command handlers.
//!
//! Replies are single lines; failures the protocol expects (duplicate key,
//! missing key, unknown service) are reported in-band with `rc=-1` and an
//! underscore-joined `msg`.

use super::{Context, Handler, notify_barrier};
use crate::error::{KvsError, PmiError};
use crate::group::BarrierOutcome;
use crate::kvs::{KEY_MAX, KVSNAME_MAX, VAL_MAX};
use crate::service::DEFAULT_PGID;
use crate::token::Tokens;

pub(super) const HANDLERS: &[Handler] = &[
    Handler { cmd: "init", handler: init },
    Handler { cmd: "initack", handler: initack },
    Handler { cmd: "get_maxes", handler: get_maxes },
    Handler { cmd: "get_appnum", handler: get_appnum },
    Handler { cmd: "get_universe_size", handler: get_universe_size },
    Handler { cmd: "get_my_kvsname", handler: get_my_kvsname },
    Handler { cmd: "barrier_in", handler: barrier_in },
    Handler { cmd: "put", handler: put },
    Handler { cmd: "get", handler: get },
    Handler { cmd: "publish_name", handler: publish_name },
    Handler { cmd: "unpublish_name", handler: unpublish_name },
    Handler { cmd: "lookup_name", handler: lookup_name },
    Handler { cmd: "abort", handler: abort },
    Handler { cmd: "finalize", handler: finalize },
];

fn init(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let version: i32 = tokens
        .find_parsed("pmi_version")?
        .ok_or_else(|| PmiError::MissingKey {
            cmd: ctx.cmd().to_string(),
            key: "pmi_version",
        })?;
    let rc = if version == 1 { 0 } else { -1 };
    if rc != 0 {
        tracing::warn!(conn = %ctx.conn(), version, "Unsupported PMI version requested");
    }
    let resp = ctx
        .response("response_to_init")
        .arg("pmi_version", 1)
        .arg("pmi_subversion", 1)
        .rc(rc);
    ctx.reply(resp);
    Ok(())
}

fn initack(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let pid: i32 = tokens
        .find_parsed("pmiid")?
        .ok_or_else(|| PmiError::MissingKey {
            cmd: ctx.cmd().to_string(),
            key: "pmiid",
        })?;
    ctx.bind(DEFAULT_PGID, pid, "pmiid")?;

    let (_, group) = ctx.group()?;
    let size = group.size();
    let debug = i32::from(ctx.config().debug);

    let resp = ctx.response("initack");
    ctx.reply(resp);
    let resp = ctx.response("set").arg("size", size);
    ctx.reply(resp);
    let resp = ctx.response("set").arg("rank", pid);
    ctx.reply(resp);
    let resp = ctx.response("set").arg("debug", debug);
    ctx.reply(resp);
    Ok(())
}

fn get_maxes(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let resp = ctx
        .response("maxes")
        .arg("kvsname_max", KVSNAME_MAX)
        .arg("keylen_max", KEY_MAX)
        .arg("vallen_max", VAL_MAX);
    ctx.reply(resp);
    Ok(())
}

fn get_appnum(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let resp = ctx.response("appnum").arg("appnum", ctx.config().appnum);
    ctx.reply(resp);
    Ok(())
}

fn get_universe_size(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let size = match ctx.config().universe_size {
        Some(size) => size,
        None => ctx.group()?.1.size(),
    };
    let resp = ctx.response("universe_size").arg("size", size);
    ctx.reply(resp);
    Ok(())
}

fn get_my_kvsname(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let (_, group) = ctx.group()?;
    let name = group.kvs().name().to_string();
    let resp = ctx.response("my_kvsname").arg("kvsname", name);
    ctx.reply(resp);
    Ok(())
}

fn barrier_in(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let conn = ctx.conn();
    let (binding, group, outbox) = ctx.group_with_outbox()?;
    match group.enter_barrier(conn, binding.pid) {
        BarrierOutcome::Released(release) => notify_barrier(group, release, outbox),
        BarrierOutcome::Waiting { count, needed } => {
            tracing::trace!(%conn, pid = binding.pid, count, needed, "Waiting in barrier");
        }
        BarrierOutcome::Exited => {
            return Err(PmiError::ProcessExited {
                pgid: binding.pgid,
                pid: binding.pid,
            });
        }
        BarrierOutcome::Duplicate => return Err(PmiError::AlreadyWaiting { pid: binding.pid }),
    }
    Ok(())
}

/// Reject a `kvsname=` that names some other namespace.
fn check_kvsname(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let Some(requested) = tokens.find("kvsname") else {
        return Ok(());
    };
    let (_, group) = ctx.group()?;
    if requested != group.kvs().name() {
        return Err(PmiError::InvalidValue {
            key: "kvsname",
            value: requested.to_string(),
        });
    }
    Ok(())
}

fn put(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let key = tokens.require(ctx.cmd(), "key")?;
    let value = tokens.require(ctx.cmd(), "value")?;
    check_kvsname(ctx, tokens)?;

    let (binding, group) = ctx.group()?;
    let resp = match group.kvs_mut().put(key, value) {
        Ok(()) => {
            tracing::trace!(pgid = binding.pgid, pid = binding.pid, key, "Put");
            ctx.response("put_result").rc(0).arg("msg", "success")
        }
        Err(KvsError::DuplicateKey(key)) => ctx
            .response("put_result")
            .rc(-1)
            .arg("msg", format!("duplicate_key_{key}")),
        Err(e) => return Err(e.into()),
    };
    ctx.reply(resp);
    Ok(())
}

fn get(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let key = tokens.require(ctx.cmd(), "key")?;
    check_kvsname(ctx, tokens)?;

    let (_, group) = ctx.group()?;
    let value = group.kvs().get(key).map(str::to_string);
    let resp = match value {
        Some(value) => ctx
            .response("get_result")
            .rc(0)
            .arg("msg", "success")
            .arg("value", value),
        None => ctx
            .response("get_result")
            .rc(-1)
            .arg("msg", format!("key_{key}_not_found"))
            .arg("value", "unknown"),
    };
    ctx.reply(resp);
    Ok(())
}

fn publish_name(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let service = tokens.require(ctx.cmd(), "service")?;
    let port = tokens.require(ctx.cmd(), "port")?;
    let resp = match ctx.names().publish(service, port) {
        Ok(()) => ctx.response("publish_result").rc(0).arg("msg", "success"),
        Err(_) => ctx
            .response("publish_result")
            .rc(-1)
            .arg("msg", format!("service_{service}_already_published")),
    };
    ctx.reply(resp);
    Ok(())
}

fn unpublish_name(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let service = tokens.require(ctx.cmd(), "service")?;
    let resp = match ctx.names().unpublish(service) {
        Ok(()) => ctx.response("unpublish_result").rc(0).arg("msg", "success"),
        Err(_) => ctx
            .response("unpublish_result")
            .rc(-1)
            .arg("msg", format!("service_{service}_not_found")),
    };
    ctx.reply(resp);
    Ok(())
}

fn lookup_name(ctx: &mut Context<'_>, tokens: &Tokens) -> Result<(), PmiError> {
    let service = tokens.require(ctx.cmd(), "service")?;
    let port = ctx.names().lookup(service).map(str::to_string);
    let resp = match port {
        Ok(port) => ctx
            .response("lookup_result")
            .rc(0)
            .arg("msg", "success")
            .arg("port", port),
        Err(_) => ctx
            .response("lookup_result")
            .rc(-1)
            .arg("msg", format!("service_{service}_not_found")),
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
        exitcode = tokens.find("exitcode").unwrap_or("unknown"),
        message = tokens.find("message").unwrap_or(""),
        "Process aborted"
    );
    Ok(())
}

fn finalize(ctx: &mut Context<'_>, _tokens: &Tokens) -> Result<(), PmiError> {
    let binding = ctx.mark_caller_dead()?;
    tracing::debug!(conn = %ctx.conn(), pgid = binding.pgid, pid = binding.pid, "Process finalized");
    let resp = ctx.response("finalize_ack");
    ctx.reply(resp);
    Ok(())
}
