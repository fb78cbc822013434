//! Agent bootstrap protocol.
//!
//! Remote backends have no side channel to a workload's network address,
//! so the launched job first fetches a bootstrap script from the agent
//! endpoint (`action=bootstrap`), runs it, and the script reports back
//! with `action=set_ip_port` before the container runtime starts. The port
//! it settles on is exported as `BASE_PORT` to the container.

pub mod token;

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, TetherError};
use crate::settings::Settings;
use crate::shell::shell_quote;
use crate::store::TaskStore;

pub use token::{CallbackTokens, TokenError};

/// Path of the agent endpoint, relative to the callback base address.
pub const AGENT_PATH: &str = "/api/v1/agent/";

/// Ephemeral range the bootstrap script picks base ports from.
pub const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Ports probed from the base port upward.
const PORTS_PER_TASK: u16 = 3;

const BOOTSTRAP_TEMPLATE: &str = r#"#!/bin/bash
# tether agent bootstrap for task @TASK_ID@
CALLBACK=@CALLBACK@
TASK_ID=@TASK_ID@
TOKEN_PARAM=@TOKEN_PARAM@

host_ip() {
    local ip
    ip=$(hostname -I 2>/dev/null | awk '{print $1}')
    if [ -z "$ip" ]; then
        ip=$(hostname -i 2>/dev/null | awk '{print $1}')
    fi
    echo "${ip:-127.0.0.1}"
}

port_busy() {
    (exec 3<>"/dev/tcp/127.0.0.1/$1") 2>/dev/null
}

fetch() {
    if command -v wget >/dev/null 2>&1; then
        wget -q -O - "$1"
    else
        curl -fsS "$1"
    fi
}

IP=$(host_ip)
while true; do
    BASE_PORT=$(( @FIRST_PORT@ + (RANDOM * 32768 + RANDOM) % @PORT_SPAN@ ))
    BUSY=0
    for OFFSET in $(seq 0 @LAST_OFFSET@); do
        if port_busy $((BASE_PORT + OFFSET)); then
            BUSY=1
            break
        fi
    done
    if [ "$BUSY" = 0 ]; then
        break
    fi
    sleep 1
done

REPLY=$(fetch "${CALLBACK}?task_id=${TASK_ID}&action=set_ip_port&ip=${IP}&port=${BASE_PORT}${TOKEN_PARAM}")
if [ "$REPLY" != "OK" ]; then
    echo "tether agent: callback rejected: $REPLY" >&2
    exit 1
fi
echo "$BASE_PORT"
"#;

/// The agent endpoint as reached from a backend.
pub fn agent_url(settings: &Settings) -> String {
    format!("{}{AGENT_PATH}", settings.callback_url.trim_end_matches('/'))
}

fn token_param(settings: &Settings, task_id: Uuid) -> String {
    settings
        .callback_tokens
        .as_ref()
        .map(|tokens| format!("&token={}", tokens.issue(task_id)))
        .unwrap_or_default()
}

/// URL a backend fetches the bootstrap script from.
pub fn bootstrap_url(settings: &Settings, task_id: Uuid) -> String {
    format!(
        "{}?task_id={task_id}&action=bootstrap{}",
        agent_url(settings),
        token_param(settings, task_id)
    )
}

/// Render the bootstrap script for one task.
pub fn render_bootstrap(settings: &Settings, task_id: Uuid) -> String {
    let first = *EPHEMERAL_PORTS.start();
    // The whole triplet must stay inside the range.
    let span = u32::from(*EPHEMERAL_PORTS.end()) - u32::from(first) + 2 - u32::from(PORTS_PER_TASK);

    BOOTSTRAP_TEMPLATE
        .replace("@CALLBACK@", &shell_quote(&agent_url(settings)))
        .replace("@TASK_ID@", &task_id.to_string())
        .replace("@TOKEN_PARAM@", &shell_quote(&token_param(settings, task_id)))
        .replace("@FIRST_PORT@", &first.to_string())
        .replace("@PORT_SPAN@", &span.to_string())
        .replace("@LAST_OFFSET@", &(PORTS_PER_TASK - 1).to_string())
}

/// Query parameters of an agent request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRequest {
    pub task_id: Option<String>,
    pub action: Option<String>,
    pub ip: Option<String>,
    pub port: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    Bootstrap,
    SetIpPort { ip: String, port: u16 },
}

impl AgentRequest {
    /// Validate the raw parameters.
    pub fn parse(&self) -> Result<(Uuid, AgentAction)> {
        let raw_id = non_empty(self.task_id.as_deref())
            .ok_or_else(|| TetherError::Protocol("missing task_id".to_owned()))?;
        let task_id = Uuid::parse_str(raw_id)
            .map_err(|_| TetherError::Protocol(format!("invalid task_id {raw_id:?}")))?;

        let action = match non_empty(self.action.as_deref()) {
            Some("bootstrap") => AgentAction::Bootstrap,
            Some("set_ip_port") => {
                let ip = non_empty(self.ip.as_deref())
                    .ok_or_else(|| TetherError::Protocol("missing ip".to_owned()))?;
                let port = self.port.as_deref().unwrap_or_default();
                AgentAction::SetIpPort {
                    ip: ip.to_owned(),
                    port: parse_port(port)?,
                }
            }
            Some(other) => {
                return Err(TetherError::Protocol(format!("unknown action {other:?}")));
            }
            None => return Err(TetherError::Protocol("missing action".to_owned())),
        };
        Ok((task_id, action))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A port must be an integer in `1..=65535`.
pub fn parse_port(raw: &str) -> Result<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(TetherError::Protocol(format!("invalid port {raw:?}"))),
    }
}

/// Serves the agent endpoint.
#[derive(Clone)]
pub struct AgentEndpoint {
    store: Arc<dyn TaskStore>,
    settings: Arc<Settings>,
}

impl AgentEndpoint {
    pub fn new(store: Arc<dyn TaskStore>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Answer one request. The body is the bootstrap script for
    /// `bootstrap` and the literal `OK` for `set_ip_port`.
    pub async fn handle(&self, request: &AgentRequest) -> Result<String> {
        let (task_id, action) = request.parse()?;
        self.check_token(task_id, request.token.as_deref())?;

        match action {
            AgentAction::Bootstrap => {
                if self.store.get_task(task_id).await?.is_none() {
                    return Err(TetherError::not_found("task", task_id));
                }
                Ok(render_bootstrap(&self.settings, task_id))
            }
            AgentAction::SetIpPort { ip, port } => {
                if !self.store.set_address(task_id, &ip, i32::from(port)).await? {
                    return Err(TetherError::not_found("task", task_id));
                }
                info!(%task_id, %ip, port, "agent reported address");
                Ok("OK".to_owned())
            }
        }
    }

    fn check_token(&self, task_id: Uuid, token: Option<&str>) -> Result<()> {
        let Some(tokens) = &self.settings.callback_tokens else {
            return Ok(());
        };
        let token = token.ok_or_else(|| TetherError::Forbidden("missing callback token".into()))?;
        tokens.verify(token, task_id).map_err(|e| {
            warn!(%task_id, error = %e, "rejected agent callback");
            TetherError::Forbidden(e.to_string())
        })
    }
}

impl std::fmt::Debug for AgentEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEndpoint")
            .field("callback_url", &self.settings.callback_url)
            .finish_non_exhaustive()
    }
}
