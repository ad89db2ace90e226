use std::time::{Duration, Instant};

use judge_contracts::SANDBOX_PROTOCOL_VERSION;
use judge_value::Value;
use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::context::{Context, Exit, Wait};
use crate::{CancelToken, InvokeError, LoadError, LoadErrorKind, SandboxConfig, SourceUnit};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Handshake {
    Ready { protocol: String },
    LoadError { kind: String, message: String },
}

/// One call. The driver echoes `id`; anything else on the stream means the
/// submission wrote to the protocol descriptor itself.
#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    args: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    id: u64,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// A loaded submission: the entry point is known to exist in a live, isolated context.
///
/// Owned by exactly one test run. Dropping the handle kills the context; [`teardown`]
/// does the same and also returns the captured output.
///
/// [`teardown`]: ExecutionHandle::teardown
pub struct ExecutionHandle {
    source: SourceUnit,
    config: SandboxConfig,
    cancel: CancelToken,
    context: Option<Context>,
    captured: Vec<u8>,
    captured_truncated: bool,
    restarts: u32,
    last_request: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Teardown {
    /// Output printed by the submission across every context it ran in, capped.
    pub stderr: String,
    pub stderr_truncated: bool,
    /// Contexts started after the first one, because an earlier one was killed or reset.
    pub restarts: u32,
}

/// Starts a fresh isolated context for `source` and loads it.
pub fn load(
    source: SourceUnit,
    config: &SandboxConfig,
    cancel: &CancelToken,
) -> Result<ExecutionHandle, LoadError> {
    let context = start_context(&source, config, cancel)?;
    Ok(ExecutionHandle {
        source,
        config: config.clone(),
        cancel: cancel.clone(),
        context: Some(context),
        captured: Vec::new(),
        captured_truncated: false,
        restarts: 0,
        last_request: 0,
    })
}

fn start_context(
    source: &SourceUnit,
    config: &SandboxConfig,
    cancel: &CancelToken,
) -> Result<Context, LoadError> {
    if cancel.is_cancelled() {
        return Err(LoadError::new(LoadErrorKind::Cancelled, "submission cancelled"));
    }
    let mut ctx = Context::spawn(source, config).map_err(LoadError::sandbox)?;
    let deadline = Instant::now() + config.load_timeout;

    let failure = match ctx.wait_frame(deadline, cancel) {
        Wait::Frame(Frame::Line(line)) => match serde_json::from_str::<Handshake>(&line) {
            Ok(Handshake::Ready { protocol }) if protocol == SANDBOX_PROTOCOL_VERSION => {
                if ctx.output_exceeded() {
                    LoadError::new(
                        LoadErrorKind::ResourceExceeded,
                        output_limit_message(config),
                    )
                } else {
                    return Ok(ctx);
                }
            }
            Ok(Handshake::Ready { protocol }) => LoadError::sandbox(anyhow::anyhow!(
                "sandbox driver speaks {protocol:?}, expected {SANDBOX_PROTOCOL_VERSION:?}"
            )),
            Ok(Handshake::LoadError { kind, message }) => {
                load_error_from_driver(&kind, &message, config)
            }
            Err(err) => LoadError::new(
                LoadErrorKind::Exception,
                format!("Failed to execute code: malformed handshake from sandbox ({err})"),
            ),
        },
        Wait::Frame(Frame::TooLong) | Wait::Frame(Frame::Garbled(_)) => LoadError::new(
            LoadErrorKind::Exception,
            "Failed to execute code: malformed handshake from sandbox",
        ),
        Wait::Closed => {
            let exit = ctx.reap_after_close();
            let kind = if exit.is_resource_kill() {
                LoadErrorKind::ResourceExceeded
            } else {
                LoadErrorKind::Exception
            };
            LoadError::new(kind, format!("Failed to execute code: {}", exit.describe()))
        }
        Wait::TimedOut => {
            tracing::warn!(
                limit_ms = config.load_timeout.as_millis() as u64,
                "submission load timed out; killing context"
            );
            LoadError::new(
                LoadErrorKind::Timeout,
                format!(
                    "Failed to execute code: load timed out after {} ms",
                    config.load_timeout.as_millis()
                ),
            )
        }
        Wait::Cancelled => LoadError::new(LoadErrorKind::Cancelled, "submission cancelled"),
    };

    let (stderr, _) = ctx.terminate();
    Err(failure.with_stderr(&stderr))
}

fn load_error_from_driver(kind: &str, message: &str, config: &SandboxConfig) -> LoadError {
    let entry = &config.entry_point;
    match kind {
        "missing_entry_point" => LoadError::new(
            LoadErrorKind::MissingEntryPoint,
            format!("Define a callable '{entry}' function"),
        ),
        "not_callable" => LoadError::new(
            LoadErrorKind::MissingEntryPoint,
            format!("Define a callable '{entry}' function ('{entry}' is not callable)"),
        ),
        "resource" => LoadError::new(
            LoadErrorKind::ResourceExceeded,
            format!("Failed to execute code: {message}"),
        ),
        _ => LoadError::new(
            LoadErrorKind::Exception,
            format!("Failed to execute code: {message}"),
        ),
    }
}

fn output_limit_message(config: &SandboxConfig) -> String {
    format!("output limit exceeded ({} bytes)", config.max_output_bytes)
}

impl ExecutionHandle {
    pub fn entry_point(&self) -> &str {
        &self.config.entry_point
    }

    /// Calls the entry point with `args` as positional arguments.
    ///
    /// Timeouts, resource ceilings and crashes kill the current context; the next call
    /// reloads the submission into a fresh one.
    pub fn invoke(&mut self, args: &[Value], time_limit: Duration) -> Result<Value, InvokeError> {
        self.invoke_timed(args, time_limit).0
    }

    /// [`invoke`](Self::invoke), plus the wall-clock time of the call itself: from
    /// sending the request to its response or failure. Reloading a killed context
    /// first is not included.
    pub fn invoke_timed(
        &mut self,
        args: &[Value],
        time_limit: Duration,
    ) -> (Result<Value, InvokeError>, Duration) {
        if self.cancel.is_cancelled() {
            self.reset();
            return (Err(InvokeError::Cancelled), Duration::ZERO);
        }
        let ctx = match self.context.take() {
            Some(ctx) => ctx,
            None => match self.restart() {
                Ok(ctx) => ctx,
                Err(err) => return (Err(err), Duration::ZERO),
            },
        };
        let started = Instant::now();
        let result = self.call(ctx, args, time_limit, started);
        (result, started.elapsed())
    }

    fn call(
        &mut self,
        mut ctx: Context,
        args: &[Value],
        time_limit: Duration,
        started: Instant,
    ) -> Result<Value, InvokeError> {
        if ctx.unsolicited_frame().is_some() {
            self.retire(ctx);
            return Err(InvokeError::RuntimeFault(
                "sandbox protocol out of sync: output arrived with no call pending".to_string(),
            ));
        }

        self.last_request += 1;
        let id = self.last_request;
        let request = match serde_json::to_string(&Request { id, args }) {
            Ok(request) => request,
            Err(err) => {
                self.context = Some(ctx);
                return Err(InvokeError::Sandbox(err.into()));
            }
        };
        let deadline = started + time_limit;

        if ctx.send(request).is_err() {
            // Broken pipe: the child is already gone.
            let exit = ctx.reap_after_close();
            self.retire(ctx);
            return Err(fault_from_exit(exit));
        }

        match ctx.wait_frame(deadline, &self.cancel) {
            Wait::Frame(Frame::Line(line)) => {
                if ctx.output_exceeded() {
                    self.retire(ctx);
                    return Err(InvokeError::ResourceExceeded(output_limit_message(
                        &self.config,
                    )));
                }
                let response = match serde_json::from_str::<Response>(&line) {
                    Ok(response) => response,
                    Err(err) => {
                        self.retire(ctx);
                        return Err(InvokeError::RuntimeFault(format!(
                            "malformed response from sandbox ({err})"
                        )));
                    }
                };
                if response.id != id {
                    self.retire(ctx);
                    return Err(InvokeError::RuntimeFault(format!(
                        "sandbox protocol out of sync: response {} while waiting for {id}",
                        response.id
                    )));
                }
                if response.ok {
                    self.context = Some(ctx);
                    return Ok(response.value);
                }
                match response.kind.as_str() {
                    "resource" => {
                        self.retire(ctx);
                        Err(InvokeError::ResourceExceeded(response.message))
                    }
                    "unrepresentable" => {
                        self.context = Some(ctx);
                        Err(InvokeError::RuntimeFault(format!(
                            "return value is not representable: {}",
                            response.message
                        )))
                    }
                    _ => {
                        self.context = Some(ctx);
                        Err(InvokeError::RuntimeFault(response.message))
                    }
                }
            }
            Wait::Frame(Frame::TooLong) => {
                self.retire(ctx);
                Err(InvokeError::ResourceExceeded(format!(
                    "return value exceeds output limit ({} bytes)",
                    self.config.max_output_bytes
                )))
            }
            Wait::Frame(Frame::Garbled(err)) => {
                self.retire(ctx);
                Err(InvokeError::RuntimeFault(format!(
                    "malformed response from sandbox ({err})"
                )))
            }
            Wait::Closed => {
                let exit = ctx.reap_after_close();
                let output_exceeded = ctx.output_exceeded();
                self.retire(ctx);
                if output_exceeded {
                    return Err(InvokeError::ResourceExceeded(output_limit_message(
                        &self.config,
                    )));
                }
                Err(fault_from_exit(exit))
            }
            Wait::TimedOut => {
                tracing::warn!(
                    limit_ms = time_limit.as_millis() as u64,
                    "entry point exceeded its time limit; killing context"
                );
                self.retire(ctx);
                Err(InvokeError::Timeout { limit: time_limit })
            }
            Wait::Cancelled => {
                self.retire(ctx);
                Err(InvokeError::Cancelled)
            }
        }
    }

    /// Drops the current context; the next `invoke` starts from a fresh load.
    pub fn reset(&mut self) {
        if let Some(ctx) = self.context.take() {
            self.retire(ctx);
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Output printed so far by contexts that have already ended.
    pub fn captured_stderr(&self) -> String {
        String::from_utf8_lossy(&self.captured).into_owned()
    }

    /// Kills the context (if one is live) and returns the captured output.
    pub fn teardown(mut self) -> Teardown {
        self.reset();
        Teardown {
            stderr: String::from_utf8_lossy(&self.captured).into_owned(),
            stderr_truncated: self.captured_truncated,
            restarts: self.restarts,
        }
    }

    fn restart(&mut self) -> Result<Context, InvokeError> {
        self.restarts += 1;
        tracing::debug!(restarts = self.restarts, "reloading submission into a fresh context");
        start_context(&self.source, &self.config, &self.cancel).map_err(|err| match err.kind {
            LoadErrorKind::Cancelled => InvokeError::Cancelled,
            LoadErrorKind::Sandbox => InvokeError::Sandbox(anyhow::anyhow!(err.message)),
            _ => InvokeError::RuntimeFault(format!(
                "could not reload submission after a previous failure: {}",
                err.message
            )),
        })
    }

    fn retire(&mut self, ctx: Context) {
        let (stderr, truncated) = ctx.terminate();
        let remaining = self.config.max_output_bytes.saturating_sub(self.captured.len());
        if stderr.len() > remaining {
            self.captured.extend_from_slice(&stderr[..remaining]);
            self.captured_truncated = true;
        } else {
            self.captured.extend_from_slice(&stderr);
        }
        self.captured_truncated |= truncated;
    }
}

fn fault_from_exit(exit: Exit) -> InvokeError {
    if exit.is_resource_kill() {
        InvokeError::ResourceExceeded(exit.describe())
    } else {
        InvokeError::RuntimeFault(exit.describe())
    }
}
