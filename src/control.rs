//! Line-oriented control channel of the daemon.
//!
//! Every request is one JSON object on its own line, tagged by `op`:
//!
//! ```text
//! {"op": "apply", "counter": "likes", "delta": 2, "type": "Increment Counter"}
//! {"op": "get", "counter": "likes"}
//! {"op": "list", "namespace": "site", "limit": 5}
//! {"op": "dashboard", "namespace": "site"}
//! {"op": "writeback", "delete": true}
//! {"op": "clear_cache"}
//! ```
//!
//! Each one is answered by a single line, `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": "..."}`.

use crate::admin::{self, default_namespace, CounterForm, DASHBOARD_LIMIT};
use crate::cache::FastCache;
use crate::counter::Coordinator;
use crate::queue::WorkQueue;
use crate::store::DurableStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Apply(CounterForm),
    Get {
        counter: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
    List {
        namespace: Option<String>,
        #[serde(default = "list_limit_default")]
        limit: usize,
    },
    Dashboard {
        #[serde(default = "default_namespace")]
        namespace: String,
        counter: Option<String>,
        #[serde(default)]
        delta: i64,
    },
    Writeback {
        namespace: Option<String>,
        #[serde(default)]
        delete: bool,
    },
    ClearCache,
}

fn list_limit_default() -> usize {
    DASHBOARD_LIMIT
}

#[derive(Debug, Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Reply {
    fn from_result(result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                ok: false,
                result: None,
                error: Some(format!("{err:#}")),
            },
        }
    }
}

pub async fn execute<C, S, Q>(
    counter: &Coordinator<C, S, Q>,
    command: Command,
) -> anyhow::Result<Value>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    let value = match command {
        Command::Apply(form) => Value::from(admin::apply(counter, &form).await?),
        Command::Get { counter: name, namespace } => {
            serde_json::to_value(admin::get_count(counter, &name, &namespace).await?)?
        }
        Command::List { namespace, limit } => {
            let listing = admin::list_counters(counter, namespace.as_deref(), limit).await?;
            serde_json::from_str(&listing)?
        }
        Command::Dashboard {
            namespace,
            counter: name,
            delta,
        } => {
            let view = admin::dashboard(counter, &namespace, name.as_deref(), delta).await?;
            serde_json::to_value(view)?
        }
        Command::Writeback { namespace, delete } => {
            let report = admin::writeback_all(counter, namespace.as_deref(), delete).await?;
            serde_json::to_value(report)?
        }
        Command::ClearCache => {
            admin::clear_entire_cache(counter).await?;
            Value::Null
        }
    };
    Ok(value)
}

/// Bind the control port on localhost.
pub async fn bind_control_listener(port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|err| anyhow::anyhow!("fail to bind control listener on {port}: {err}"))?;
    tracing::info!("control channel listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve every connection in its own task until the listener fails.
pub fn spawn_control_listener<C, S, Q>(
    listener: TcpListener,
    counter: Coordinator<C, S, Q>,
) -> JoinHandle<()>
where
    C: FastCache + 'static,
    S: DurableStore + 'static,
    Q: WorkQueue + 'static,
{
    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            tracing::debug!("control connection from {peer}");
            let counter = counter.clone();
            tokio::spawn(async move {
                if let Err(err) = serve(stream, counter).await {
                    tracing::warn!("control connection from {peer} failed: {err:#}")
                }
            });
        }
    })
}

async fn serve<C, S, Q>(stream: TcpStream, counter: Coordinator<C, S, Q>) -> anyhow::Result<()>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let result = match serde_json::from_str::<Command>(&line) {
            Ok(command) => execute(&counter, command).await,
            Err(err) => Err(anyhow::anyhow!("invalid command: {err}")),
        };
        let mut reply = serde_json::to_vec(&Reply::from_result(result))?;
        reply.push(b'\n');
        writer.write_all(&reply).await?;
    }

    Ok(())
}
