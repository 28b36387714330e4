//! The read-only LDAP v3 protocol front-end (C7): per-connection dispatch over the wire
//! types from `ldap3_server`, read-only policy enforcement, and bind delegation to the IdP
//! client (C2). Grounded on `ReadOnlyLDAPServer`'s operation map (each `handle_LDAP*Request`
//! either delegates to the base `LDAPServer` or raises `LDAPProtocolError`) and on
//! `other_examples/9105c5fc_JoelLinn-sql2ldap__src-main.rs.rs`'s concrete `ldap3_server`
//! wire usage (`LdapCodec`, `FramedRead`/`FramedWrite`, per-message dispatch loop).

mod filter;

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use ldap3_server::proto::{
    LdapBindCred, LdapBindRequest, LdapBindResponse, LdapCompareRequest, LdapExtendedRequest,
    LdapExtendedResponse, LdapMsg, LdapOp, LdapPartialAttribute, LdapResult, LdapResultCode,
    LdapSearchRequest, LdapSearchResultEntry, LdapSearchScope,
};
use ldap3_server::LdapCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::attrs::AttributeMapExt;
use crate::config::Config;
use crate::directory::{DirectoryTree, SearchDepth};
use crate::oauth::OAuthClient;
use crate::refresh::RefreshEngine;

/// The OID of the "Who am I?" extended operation (RFC 4532) — the one extended operation
/// Apricot answers meaningfully; any other is reported as unsupported.
const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Shared, cloneable context every connection handler needs. Cheap to clone (everything
/// behind an `Arc`), so one is constructed once at startup and handed to each spawned
/// connection task.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub tree: Arc<DirectoryTree>,
    pub refresh: Arc<RefreshEngine>,
    pub client: Arc<dyn OAuthClient>,
}

/// Per-connection state. An LDAP connection is a sequence of binds and operations; Apricot
/// only needs to remember the DN of the most recent successful bind, for `Who am I?`.
#[derive(Default)]
struct Session {
    bound_dn: Option<String>,
}

/// Drives one LDAP connection to completion: reads framed messages, dispatches each to its
/// handler, and writes back every response. Returns when the client disconnects, sends an
/// `UnbindRequest`, or a write fails.
pub async fn handle_connection<S>(socket: S, ctx: Context)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, write_half) = tokio::io::split(socket);
    let mut requests = FramedRead::new(read_half, LdapCodec);
    let mut responses = FramedWrite::new(write_half, LdapCodec);
    let mut session = Session::default();

    while let Some(frame) = requests.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("malformed ldap message, closing connection: {err}");
                return;
            }
        };

        if matches!(msg.op, LdapOp::UnbindRequest) {
            return;
        }

        let msgid = msg.msgid;
        let replies = dispatch(msg, &ctx, &mut session).await;
        for reply in replies {
            if responses.send(reply).await.is_err() {
                return;
            }
        }
        if responses.flush().await.is_err() {
            return;
        }
        let _ = msgid;
    }
}

fn ldap_result(code: LdapResultCode, message: impl Into<String>) -> LdapResult {
    LdapResult {
        code,
        matcheddn: String::new(),
        message: message.into(),
        referral: vec![],
    }
}

fn reject(msgid: i32, op: LdapOp, operation_name: &str) -> LdapMsg {
    let message = format!("ReadOnlyLDAPServer will not handle {operation_name} requests");
    log::warn!("{message}");
    let result = ldap_result(LdapResultCode::UnwillingToPerform, message);
    let response = match op {
        LdapOp::AddRequest(_) => LdapOp::AddResponse(result),
        LdapOp::DelRequest(_) => LdapOp::DelResponse(result),
        LdapOp::ModifyRequest(_) => LdapOp::ModifyResponse(result),
        LdapOp::ModifyDNRequest(_) => LdapOp::ModifyDNResponse(result),
        _ => LdapOp::ExtendedResponse(LdapExtendedResponse { res: result, name: None, value: None }),
    };
    LdapMsg { msgid, op: response, ctrl: vec![] }
}

/// Dispatches a single decoded message to its operation handler. Any library-level failure
/// surfaced as an [`crate::error::Error`] is logged and wrapped into a generic LDAP protocol
/// error response rather than propagated — the connection itself is never torn down because
/// of it, matching `ReadOnlyLDAPServer`'s exception-to-`LDAPProtocolError` conversion.
async fn dispatch(msg: LdapMsg, ctx: &Context, session: &mut Session) -> Vec<LdapMsg> {
    let msgid = msg.msgid;
    match msg.op {
        LdapOp::BindRequest(req) => vec![handle_bind(msgid, req, ctx, session).await],
        LdapOp::SearchRequest(req) => handle_search(msgid, req, ctx).await,
        LdapOp::CompareRequest(req) => vec![handle_compare(msgid, req, ctx).await],
        LdapOp::ExtendedRequest(req) => vec![handle_extended(msgid, req, session)],
        op @ LdapOp::AddRequest(_) => vec![reject(msgid, op, "add")],
        op @ LdapOp::DelRequest(_) => vec![reject(msgid, op, "delete")],
        op @ LdapOp::ModifyRequest(_) => vec![reject(msgid, op, "modify")],
        op @ LdapOp::ModifyDNRequest(_) => vec![reject(msgid, op, "modify-DN")],
        LdapOp::UnbindRequest => vec![],
        _ => vec![LdapMsg {
            msgid,
            op: LdapOp::ExtendedResponse(LdapExtendedResponse {
                res: ldap_result(LdapResultCode::ProtocolError, "unsupported operation"),
                name: None,
                value: None,
            }),
            ctrl: vec![],
        }],
    }
}

fn bind_response(msgid: i32, code: LdapResultCode, message: impl Into<String>) -> LdapMsg {
    LdapMsg {
        msgid,
        op: LdapOp::BindResponse(LdapBindResponse { res: ldap_result(code, message), saslcreds: None }),
        ctrl: vec![],
    }
}

/// If `allow_anonymous_binds` is false and the bind DN is empty, rejects outright.
/// Otherwise resolves the bind DN, extracts `oauth_username`, and delegates verification to
/// the IdP client — success returns the entry (implicitly, via a success result), failure
/// returns "invalid credentials". Grounded on `OAuthLDAPEntry.bind`.
async fn handle_bind(msgid: i32, req: LdapBindRequest, ctx: &Context, session: &mut Session) -> LdapMsg {
    let password = match &req.cred {
        LdapBindCred::Simple(pw) => pw.clone(),
        _ => return bind_response(msgid, LdapResultCode::AuthMethodNotSupported, "only simple bind is supported"),
    };

    if req.dn.is_empty() {
        if !ctx.config.allow_anonymous_binds {
            return bind_response(msgid, LdapResultCode::UnwillingToPerform, "anonymous binds are not allowed");
        }
        session.bound_dn = None;
        return bind_response(msgid, LdapResultCode::Success, "");
    }

    if let Err(err) = ctx.refresh.ensure_fresh().await {
        return bind_response(msgid, LdapResultCode::Busy, err.to_string());
    }

    let entry = match ctx.tree.lookup(&req.dn).await {
        Ok(entry) => entry,
        Err(_) => return bind_response(msgid, LdapResultCode::InvalidCredentials, "invalid credentials"),
    };

    let oauth_username = entry.attributes.first_ci("oauth_username").unwrap_or_default().to_string();
    match ctx.client.verify(&oauth_username, &password).await {
        Ok(true) => {
            session.bound_dn = Some(req.dn.clone());
            bind_response(msgid, LdapResultCode::Success, "")
        }
        Ok(false) => bind_response(msgid, LdapResultCode::InvalidCredentials, "invalid credentials"),
        Err(err) => {
            log::error!("bind verification failed for '{}': {err}", req.dn);
            bind_response(msgid, LdapResultCode::Other, err.to_string())
        }
    }
}

fn to_search_result_entry(dn: &str, attributes: &crate::attrs::AttributeMap, requested: &[String]) -> LdapSearchResultEntry {
    let want_all = requested.is_empty() || requested.iter().any(|a| a == "*");
    let attributes = attributes
        .iter()
        .filter(|(name, _)| want_all || requested.iter().any(|r| r.eq_ignore_ascii_case(name)))
        .map(|(name, values)| LdapPartialAttribute { atype: name.clone(), vals: values.clone() })
        .collect();
    LdapSearchResultEntry { dn: dn.to_string(), attributes }
}

fn root_dse_entry(root_dn: &str) -> LdapSearchResultEntry {
    LdapSearchResultEntry {
        dn: String::new(),
        attributes: vec![
            LdapPartialAttribute { atype: "objectClass".to_string(), vals: vec!["top".to_string()] },
            LdapPartialAttribute { atype: "namingContexts".to_string(), vals: vec![root_dn.to_string()] },
            LdapPartialAttribute { atype: "supportedLDAPVersion".to_string(), vals: vec!["3".to_string()] },
        ],
    }
}

fn search_done(msgid: i32, code: LdapResultCode, message: impl Into<String>) -> LdapMsg {
    LdapMsg { msgid, op: LdapOp::SearchResultDone(ldap_result(code, message)), ctrl: vec![] }
}

/// Root DSE search (empty base, base scope) is answered directly; every other search walks
/// the current directory-tree generation from `base` according to `scope`, evaluates the
/// filter against each candidate's attributes, and projects the requested attributes.
/// Grounded on `ReadOnlyLDAPServer.handle_LDAPSearchRequest`, which just delegates to the
/// base in-memory LDAP server's own search evaluation — the walk-and-filter logic here is
/// that evaluation, reimplemented directly against [`DirectoryTree`] since no Rust crate in
/// this dependency stack ships an equivalent in-memory LDAP search engine.
async fn handle_search(msgid: i32, req: LdapSearchRequest, ctx: &Context) -> Vec<LdapMsg> {
    if req.base.is_empty() && req.scope == LdapSearchScope::Base {
        let mut out = vec![LdapMsg {
            msgid,
            op: LdapOp::SearchResultEntry(root_dse_entry(ctx.tree.root_dn())),
            ctrl: vec![],
        }];
        out.push(search_done(msgid, LdapResultCode::Success, ""));
        return out;
    }

    if let Err(err) = ctx.refresh.ensure_fresh().await {
        return vec![search_done(msgid, LdapResultCode::Busy, err.to_string())];
    }

    let Some(root) = ctx.tree.current().await else {
        return vec![search_done(msgid, LdapResultCode::Busy, "directory unavailable")];
    };

    let base_entry = match ctx.tree.lookup_in(&root, &req.base) {
        Ok(entry) => entry,
        Err(err) => return vec![search_done(msgid, LdapResultCode::NoSuchObject, err.to_string())],
    };

    let depth = match req.scope {
        LdapSearchScope::Base => SearchDepth::Base,
        LdapSearchScope::OneLevel => SearchDepth::OneLevel,
        LdapSearchScope::Subtree => SearchDepth::Subtree,
    };

    let mut out: Vec<LdapMsg> = DirectoryTree::descendants(&base_entry, depth)
        .into_iter()
        .filter(|entry| filter::matches(&entry.attributes, &req.filter))
        .map(|entry| LdapMsg {
            msgid,
            op: LdapOp::SearchResultEntry(to_search_result_entry(&entry.dn, &entry.attributes, &req.attrs)),
            ctrl: vec![],
        })
        .collect();
    out.push(search_done(msgid, LdapResultCode::Success, ""));
    out
}

/// Grounded on `ReadOnlyLDAPServer.handle_LDAPCompareRequest`'s base-implementation
/// delegation: resolves the target DN and tests whether its named attribute contains the
/// asserted value, case-insensitively per usual LDAP attribute-value matching.
async fn handle_compare(msgid: i32, req: LdapCompareRequest, ctx: &Context) -> LdapMsg {
    if let Err(err) = ctx.refresh.ensure_fresh().await {
        return LdapMsg {
            msgid,
            op: LdapOp::CompareResponse(ldap_result(LdapResultCode::Busy, err.to_string())),
            ctrl: vec![],
        };
    }

    let code = match ctx.tree.lookup(&req.entry).await {
        Ok(entry) => match entry.attributes.get_ci(&req.ava.0) {
            Some(values) if values.iter().any(|v| v.eq_ignore_ascii_case(&req.ava.1)) => LdapResultCode::CompareTrue,
            Some(_) => LdapResultCode::CompareFalse,
            None => LdapResultCode::CompareFalse,
        },
        Err(_) => LdapResultCode::NoSuchObject,
    };
    LdapMsg { msgid, op: LdapOp::CompareResponse(ldap_result(code, "")), ctrl: vec![] }
}

/// The only extended operation Apricot understands is "Who am I?" (RFC 4532), answered from
/// the session's bound DN. Anything else is reported as unsupported, matching
/// `ReadOnlyLDAPServer.handle_LDAPExtendedRequest`'s pass-through-or-fail shape.
fn handle_extended(msgid: i32, req: LdapExtendedRequest, session: &Session) -> LdapMsg {
    if req.name == WHOAMI_OID {
        let value = session.bound_dn.as_ref().map(|dn| format!("dn:{dn}").into_bytes());
        return LdapMsg {
            msgid,
            op: LdapOp::ExtendedResponse(LdapExtendedResponse {
                res: ldap_result(LdapResultCode::Success, ""),
                name: None,
                value,
            }),
            ctrl: vec![],
        };
    }
    LdapMsg {
        msgid,
        op: LdapOp::ExtendedResponse(LdapExtendedResponse {
            res: ldap_result(LdapResultCode::ProtocolError, format!("unsupported extended operation {}", req.name)),
            name: None,
            value: None,
        }),
        ctrl: vec![],
    }
}
