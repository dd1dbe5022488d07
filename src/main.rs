use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use xenon_rs::adaptor::Xenon;
use xenon_rs::command_runner::CommandRunner;
use xenon_rs::config::XenonConfig;
use xenon_rs::job::{CopyMode, JobDescription};
use xenon_rs::path::Path as XenonPath;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let root = std::env::var("XENON_ROOT")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().expect("current directory must be readable"));
    let xenon = Arc::new(Xenon::local(XenonConfig::load_or_default()?, root)?);

    let server = McpServer::new(xenon);

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut out = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let id = msg.get("id").cloned().unwrap_or(Value::Null);
        let params = msg.get("params").cloned().unwrap_or(json!({}));

        let response = match method {
            "initialize" => server.initialize(id, &params),
            "tools/list" => server.tools_list(id),
            "tools/call" => server.tool_call(id, &params).await,
            "notifications/initialized" | "notifications/cancelled" => continue,
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {}", method) }
            }),
        };

        let mut s = serde_json::to_string(&response)?;
        s.push('\n');
        out.write_all(s.as_bytes()).await?;
        out.flush().await?;
    }

    xenon.close().await.ok();
    Ok(())
}

// ─── Server ───────────────────────────────────────────────────────────────

struct McpServer {
    xenon: Arc<Xenon>,
}

impl McpServer {
    fn new(xenon: Arc<Xenon>) -> Self {
        McpServer { xenon }
    }

    fn initialize(&self, id: Value, _params: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name":    "xenon-act",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }
        })
    }

    fn tools_list(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [
                    {
                        "name": "xenon_submit_job",
                        "description": "Submit a batch job to the local job-queue scheduler. Returns immediately with a job id; poll with xenon_job_status.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "executable":  { "type": "string", "description": "Program to run." },
                                "arguments":   { "type": "array", "items": { "type": "string" }, "description": "Command-line arguments." },
                                "environment": { "type": "object", "description": "Extra environment variables, applied in object key order." },
                                "queue_name":  { "type": "string", "enum": ["single", "multi", "unlimited"], "description": "Default: single." },
                                "working_directory": { "type": "string", "description": "Relative to the adaptor root." },
                                "stdin":  { "type": "string", "description": "File to redirect stdin from, relative to the working directory." },
                                "stdout": { "type": "string", "description": "File to redirect stdout to." },
                                "stderr": { "type": "string", "description": "File to redirect stderr to." },
                                "max_runtime": { "type": "integer", "description": "Minutes; -1 for adaptor default." }
                            },
                            "required": ["executable"]
                        }
                    },
                    {
                        "name": "xenon_job_status",
                        "description": "Get a submitted job's status. A terminal read harvests the job: a later call with the same id returns an error.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "job_id": { "type": "string" } },
                            "required": ["job_id"]
                        }
                    },
                    {
                        "name": "xenon_cancel_job",
                        "description": "Cancel a submitted job (kills it if running, or before it starts if still queued) and return its final status.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "job_id": { "type": "string" } },
                            "required": ["job_id"]
                        }
                    },
                    {
                        "name": "xenon_wait_until_done",
                        "description": "Block until a job reaches a terminal state, then return its status.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "job_id":     { "type": "string" },
                                "timeout_ms": { "type": "integer", "description": "0 waits indefinitely. Default 0.", "default": 0 }
                            },
                            "required": ["job_id"]
                        }
                    },
                    {
                        "name": "xenon_run_command",
                        "description": "Run a command to completion on the unlimited queue and capture stdout/stderr/exit code in one call.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "executable": { "type": "string" },
                                "arguments":  { "type": "array", "items": { "type": "string" } },
                                "stdin":      { "type": "string", "description": "Text piped to the process's stdin." }
                            },
                            "required": ["executable"]
                        }
                    },
                    {
                        "name": "xenon_list_directory",
                        "description": "List a directory's entries (with attributes) under the adaptor root.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "path":      { "type": "string", "description": "Absolute path within the adaptor, e.g. '/a/b'." },
                                "recursive": { "type": "boolean", "default": false }
                            },
                            "required": ["path"]
                        }
                    },
                    {
                        "name": "xenon_copy",
                        "description": "Copy a file or directory within the adaptor. Returns a copy id immediately; poll with xenon_copy_status.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "source":    { "type": "string" },
                                "dest":      { "type": "string" },
                                "mode":      { "type": "string", "enum": ["create", "replace", "ignore"], "default": "create" },
                                "recursive": { "type": "boolean", "default": false }
                            },
                            "required": ["source", "dest"]
                        }
                    },
                    {
                        "name": "xenon_copy_status",
                        "description": "Get a copy's progress/status. A terminal read harvests the copy.",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "copy_id": { "type": "string" } },
                            "required": ["copy_id"]
                        }
                    },
                    {
                        "name": "xenon_queue_status",
                        "description": "Report how many unharvested jobs sit in a named queue (single/multi/unlimited).",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "queue_name": { "type": "string", "enum": ["single", "multi", "unlimited"] } },
                            "required": ["queue_name"]
                        }
                    }
                ]
            }
        })
    }

    async fn tool_call(&self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let ok = |text: String| json!({ "jsonrpc": "2.0", "id": id, "result": { "content": [{"type":"text","text": text}], "isError": false } });
        let err = |msg: String| json!({ "jsonrpc": "2.0", "id": id, "result": { "content": [{"type":"text","text": msg}], "isError": true } });

        match name {
            "xenon_submit_job" => {
                let Some(executable) = args.get("executable").and_then(|v| v.as_str()) else {
                    return err("'executable' required".to_string());
                };
                let arguments = args
                    .get("arguments")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let environment = args
                    .get("environment")
                    .and_then(|v| v.as_object())
                    .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
                    .unwrap_or_default();
                let desc = JobDescription {
                    executable: executable.to_string(),
                    arguments,
                    environment,
                    queue_name: args.get("queue_name").and_then(|v| v.as_str()).map(String::from),
                    working_directory: args.get("working_directory").and_then(|v| v.as_str()).map(String::from),
                    stdin: args.get("stdin").and_then(|v| v.as_str()).map(String::from),
                    stdout: args.get("stdout").and_then(|v| v.as_str()).map(String::from),
                    stderr: args.get("stderr").and_then(|v| v.as_str()).map(String::from),
                    max_runtime: args.get("max_runtime").and_then(|v| v.as_i64()).unwrap_or(-1),
                    ..Default::default()
                };
                match self.xenon.scheduler().submit_batch_job(desc).await {
                    Ok(job_id) => ok(json!({ "job_id": job_id }).to_string()),
                    Err(e) => err(format!("xenon_submit_job failed: {e}")),
                }
            }

            "xenon_job_status" => {
                let Some(job_id) = args.get("job_id").and_then(|v| v.as_str()) else {
                    return err("'job_id' required".to_string());
                };
                match self.xenon.scheduler().get_job_status(job_id).await {
                    Ok(status) => ok(serde_json::to_string(&status).unwrap_or_default()),
                    Err(e) => err(format!("xenon_job_status failed: {e}")),
                }
            }

            "xenon_cancel_job" => {
                let Some(job_id) = args.get("job_id").and_then(|v| v.as_str()) else {
                    return err("'job_id' required".to_string());
                };
                match self.xenon.scheduler().cancel_job(job_id).await {
                    Ok(status) => ok(serde_json::to_string(&status).unwrap_or_default()),
                    Err(e) => err(format!("xenon_cancel_job failed: {e}")),
                }
            }

            "xenon_wait_until_done" => {
                let Some(job_id) = args.get("job_id").and_then(|v| v.as_str()) else {
                    return err("'job_id' required".to_string());
                };
                let timeout_ms = args.get("timeout_ms").and_then(|v| v.as_u64()).unwrap_or(0);
                match self.xenon.scheduler().wait_until_done(job_id, timeout_ms).await {
                    Ok(status) => ok(serde_json::to_string(&status).unwrap_or_default()),
                    Err(e) => err(format!("xenon_wait_until_done failed: {e}")),
                }
            }

            "xenon_run_command" => {
                let Some(executable) = args.get("executable").and_then(|v| v.as_str()) else {
                    return err("'executable' required".to_string());
                };
                let arguments: Vec<String> = args
                    .get("arguments")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let stdin = args.get("stdin").and_then(|v| v.as_str()).map(|s| s.as_bytes().to_vec());

                // `CommandRunner` only submits through `JobQueueScheduler`
                // directly (not the `SchedulerBackend` trait object), so
                // this tool only works against the concrete local adaptor
                // we construct in `main`.
                let local_sched = match downcast_local_scheduler(&self.xenon) {
                    Some(s) => s,
                    None => return err("xenon_run_command requires the local adaptor".to_string()),
                };
                let runner = CommandRunner::new(local_sched, self.xenon.adaptor_name());
                match runner.run(executable, &arguments, stdin.as_deref()).await {
                    Ok(result) => ok(json!({
                        "stdout": result.stdout_string(),
                        "stderr": result.stderr_string(),
                        "exit_code": result.exit_code,
                    })
                    .to_string()),
                    Err(e) => err(format!("xenon_run_command failed: {e}")),
                }
            }

            "xenon_list_directory" => {
                let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
                    return err("'path' required".to_string());
                };
                let recursive = args.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
                let p = XenonPath::new(path, '/');
                match self.xenon.filesystem().list(&p, recursive).await {
                    Ok(entries) => ok(serde_json::to_string(&entries).unwrap_or_default()),
                    Err(e) => err(format!("xenon_list_directory failed: {e}")),
                }
            }

            "xenon_copy" => {
                let (Some(source), Some(dest)) = (
                    args.get("source").and_then(|v| v.as_str()),
                    args.get("dest").and_then(|v| v.as_str()),
                ) else {
                    return err("'source' and 'dest' required".to_string());
                };
                let mode = match args.get("mode").and_then(|v| v.as_str()).unwrap_or("create") {
                    "create" => CopyMode::Create,
                    "replace" => CopyMode::Replace,
                    "ignore" => CopyMode::Ignore,
                    other => return err(format!("unknown copy mode '{other}'")),
                };
                let recursive = args.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
                let fs = self.xenon.filesystem().clone();
                let source_path = XenonPath::new(source, '/');
                let dest_path = XenonPath::new(dest, '/');
                match fs.copy(source_path, fs.clone(), dest_path, mode, recursive).await {
                    Ok(copy_id) => ok(json!({ "copy_id": copy_id }).to_string()),
                    Err(e) => err(format!("xenon_copy failed: {e}")),
                }
            }

            "xenon_copy_status" => {
                let Some(copy_id) = args.get("copy_id").and_then(|v| v.as_str()) else {
                    return err("'copy_id' required".to_string());
                };
                match self.xenon.filesystem().copy_status(copy_id).await {
                    Ok(status) => ok(serde_json::to_string(&status).unwrap_or_default()),
                    Err(e) => err(format!("xenon_copy_status failed: {e}")),
                }
            }

            "xenon_queue_status" => {
                let Some(queue_name) = args.get("queue_name").and_then(|v| v.as_str()) else {
                    return err("'queue_name' required".to_string());
                };
                match self.xenon.scheduler().get_queue_status(queue_name).await {
                    Ok(status) => ok(serde_json::to_string(&status).unwrap_or_default()),
                    Err(e) => err(format!("xenon_queue_status failed: {e}")),
                }
            }

            other => err(format!(
                "Unknown tool: '{}'. Available tools: xenon_submit_job, xenon_job_status, xenon_cancel_job, xenon_wait_until_done, xenon_run_command, xenon_list_directory, xenon_copy, xenon_copy_status, xenon_queue_status",
                other
            )),
        }
    }
}

/// `Xenon::local` is the only constructor this binary uses, so the
/// scheduler behind the trait object is always concretely a
/// `JobQueueScheduler`. `CommandRunner` takes that type directly rather than
/// `dyn SchedulerBackend` (it has no use for a back-end it can't also spawn
/// interactive streams from in the same call), so this downcast bridges the
/// two without widening `CommandRunner`'s own signature for a case that
/// can't occur with any adaptor this binary builds.
fn downcast_local_scheduler(xenon: &Xenon) -> Option<&xenon_rs::scheduler::JobQueueScheduler> {
    xenon.scheduler().as_any().downcast_ref()
}
