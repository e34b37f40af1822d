use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::binder::{bind, BoundCall};
use crate::catalog::{self, OperationKind, PathAccess};
use crate::config::RuntimeConfig;
use crate::envelope::{normalize, ResultEnvelope};
use crate::error::{PipelineError, PipelineErrorCode, PipelineResult};
use crate::operations::count_weekday::default_output_name;
use crate::operations::{
    CountWeekdayArgs, DataFormat, ExtractCardArgs, ExtractEmailArgs, FetchApiArgs,
    FormatFileArgs, GenerateDataArgs, MarkdownIndexArgs, OperationCall, OperationContext,
    RecentLogsArgs, ScrapeArgs, SortContactsArgs,
};
use crate::resolver::Plan;
use crate::sandbox::{SandboxGuard, SandboxedPath};

const DEFAULT_API_OUTPUT: &str = "api-response.json";

/// Maps bound calls to handlers. Built once at startup and shared.
pub struct Dispatcher {
    context: Arc<OperationContext>,
    handler_timeout: Option<Duration>,
    serialize_writes: bool,
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

struct Prepared {
    call: OperationCall,
    writes: Vec<SandboxedPath>,
}

impl Dispatcher {
    pub fn new(context: OperationContext, runtime: &RuntimeConfig) -> Self {
        Self {
            context: Arc::new(context),
            handler_timeout: (runtime.handler_timeout_ms > 0)
                .then(|| Duration::from_millis(runtime.handler_timeout_ms)),
            serialize_writes: runtime.serialize_writes,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn guard(&self) -> &SandboxGuard {
        &self.context.guard
    }

    /// Looks up the plan's operation, binds its arguments, and dispatches.
    pub async fn dispatch_plan(&self, plan: Plan) -> ResultEnvelope {
        let Some(spec) = catalog::find(&plan.operation_name) else {
            return PipelineError::unknown_operation(&plan.operation_name).into();
        };
        match bind(plan, spec) {
            Ok(call) => self.dispatch(call).await,
            Err(err) => {
                debug!(operation = spec.name(), code = err.code.as_str(), "binding failed");
                err.into()
            }
        }
    }

    pub async fn dispatch(&self, call: BoundCall) -> ResultEnvelope {
        let operation = call.operation_name();
        let prepared = match prepare(&call, &self.context.guard) {
            Ok(prepared) => prepared,
            Err(err) => {
                if err.code == PipelineErrorCode::SandboxViolation {
                    warn!(operation, "sandbox violation: {}", err.message);
                }
                return err.into();
            }
        };

        let _write_guards = if self.serialize_writes {
            self.lock_writes(&prepared.writes).await
        } else {
            Vec::new()
        };

        let context = Arc::clone(&self.context);
        let call = prepared.call;
        let envelope = normalize(
            self.run_guarded(operation, async move { call.execute(&context).await })
                .await,
        );
        let status = if envelope.is_success() { "success" } else { "error" };
        let code = envelope.error_code().map_or("none", |code| code.as_str());
        info!(operation, status, code, "dispatch finished");
        envelope
    }

    /// Runs a handler future on its own task so panics, errors and overruns
    /// surface as `HandlerFault` instead of escaping the dispatcher.
    async fn run_guarded<F>(&self, operation: &str, handler: F) -> PipelineResult<Value>
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mut handle = tokio::spawn(handler);
        let joined = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(PipelineError::handler_fault(format!(
                        "{operation} did not finish within {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PipelineError::handler_fault(format!(
                "{operation} failed: {err:#}"
            ))),
            Err(err) if err.is_panic() => Err(PipelineError::handler_fault(format!(
                "{operation} panicked: {}",
                panic_message(err.into_panic())
            ))),
            Err(err) => Err(PipelineError::handler_fault(format!(
                "{operation} was cancelled: {err}"
            ))),
        }
    }

    /// Acquires one mutex per distinct output path, in sorted order.
    async fn lock_writes(&self, paths: &[SandboxedPath]) -> Vec<OwnedMutexGuard<()>> {
        let mut unique = paths
            .iter()
            .map(|path| path.as_path().to_path_buf())
            .collect::<Vec<_>>();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return Vec::new();
        }

        let locks = {
            let mut table = self.write_locks.lock().await;
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            unique
                .into_iter()
                .map(|path| Arc::clone(table.entry(path).or_default()))
                .collect::<Vec<_>>()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_owned();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "non-string panic payload".to_owned()
}

/// Sandboxes every path argument, then assembles the typed call.
fn prepare(call: &BoundCall, guard: &SandboxGuard) -> PipelineResult<Prepared> {
    let mut args = Assembler {
        call,
        guard,
        writes: Vec::new(),
    };
    for arg in &call.args {
        if arg.param.access.is_some() {
            args.path(arg.param.name)?;
        }
    }
    args.writes.clear();

    let operation = match call.kind {
        OperationKind::GenerateData => OperationCall::GenerateData(GenerateDataArgs {
            file_url: args.required_string("file_url")?,
            argument: args.required_string("argument_to_pass")?,
            command: args.string("command_to_run"),
            is_url_remote: args.string("is_url_remote"),
            is_remote_safe: args.string("is_remote_safe"),
        }),
        OperationKind::FormatFile => OperationCall::FormatFile(FormatFileArgs {
            file: args.required_path("file_path")?,
            command: args.string("command_to_run"),
            is_prettier: args.string("is_prettier").unwrap_or_else(|| "true".to_owned()),
            prettier_version: args
                .string("prettier_version")
                .unwrap_or_else(|| "latest".to_owned()),
        }),
        OperationKind::CountWeekday => {
            let input = args.required_path("input_file_path")?;
            let weekday = args.required_string("weekday_to_count")?;
            let output = match args.path("output_file_path")? {
                Some(output) => output,
                None => args.derived_write(&default_output_name(&weekday))?,
            };
            OperationCall::CountWeekday(CountWeekdayArgs {
                input,
                weekday,
                output,
            })
        }
        OperationKind::SortContacts => OperationCall::SortContacts(SortContactsArgs {
            input: args.required_path("input_file_path")?,
            output: args.required_path("output_file_path")?,
            sort_attributes: args.strings("sort_attributes")?,
        }),
        OperationKind::WriteRecentLogs => OperationCall::WriteRecentLogs(RecentLogsArgs {
            directory: args.required_path("input_directory")?,
            file_pattern: args.string("file_pattern").unwrap_or_else(|| "*.log".to_owned()),
            output: args.required_path("output_file_path")?,
            num_files: args.count("num_files", 10)?,
            lines_per_file: args.count("lines_per_file", 1)?,
        }),
        OperationKind::IndexMarkdownTitles => {
            OperationCall::IndexMarkdownTitles(MarkdownIndexArgs {
                directory: args.required_path("input_directory")?,
                output: args.required_path("output_file_path")?,
                file_pattern: args.string("file_pattern").unwrap_or_else(|| "*.md".to_owned()),
                tag_pattern: args.string("tag_pattern").unwrap_or_else(|| "#".to_owned()),
            })
        }
        OperationKind::FetchApiData => {
            let url = args.required_string("api_url")?;
            let output = match args.path("output_file_path")? {
                Some(output) => output,
                None => args.derived_write(DEFAULT_API_OUTPUT)?,
            };
            OperationCall::FetchApiData(FetchApiArgs {
                url,
                method: args.string("http_method").unwrap_or_else(|| "GET".to_owned()),
                output,
                headers: args.object("request_headers"),
                params: args.object("request_params"),
            })
        }
        OperationKind::ScrapeWebsite => {
            let raw_format = args.string("data_format").unwrap_or_else(|| "json".to_owned());
            let format = DataFormat::parse(&raw_format).ok_or_else(|| {
                PipelineError::invalid_argument(format!(
                    "argument `data_format` must be json or csv, got `{raw_format}`"
                ))
            })?;
            OperationCall::ScrapeWebsite(ScrapeArgs {
                url: args.required_string("website_url")?,
                selectors: args.strings("css_selectors")?,
                output: args.required_path("output_file_path")?,
                format,
                max_depth: args.count("max_depth", 1)?,
            })
        }
        OperationKind::ExtractEmailSender => OperationCall::ExtractEmailSender(ExtractEmailArgs {
            input: args.required_path("input_file_path")?,
            output: args.required_path("output_file_path")?,
            instruction: args.required_string("process_instruction")?,
        }),
        OperationKind::ExtractCardNumber => OperationCall::ExtractCardNumber(ExtractCardArgs {
            image: args.required_path("input_image_path")?,
            output: args.required_path("output_file_path")?,
            instruction: args.required_string("process_instruction")?,
        }),
    };

    Ok(Prepared {
        call: operation,
        writes: args.writes,
    })
}

struct Assembler<'a> {
    call: &'a BoundCall,
    guard: &'a SandboxGuard,
    writes: Vec<SandboxedPath>,
}

impl Assembler<'_> {
    fn string(&self, name: &str) -> Option<String> {
        self.call.string(name)
    }

    fn required_string(&self, name: &str) -> PipelineResult<String> {
        self.call
            .string(name)
            .ok_or_else(|| PipelineError::missing_argument(name))
    }

    fn path(&mut self, name: &str) -> PipelineResult<Option<SandboxedPath>> {
        let Some(raw) = self.call.string(name) else {
            return Ok(None);
        };
        let resolved = self.guard.resolve(&raw)?;
        let access = self
            .call
            .kind
            .spec()
            .parameter(name)
            .and_then(|param| param.access);
        if access == Some(PathAccess::WriteFile) {
            self.writes.push(resolved.clone());
        }
        Ok(Some(resolved))
    }

    fn required_path(&mut self, name: &str) -> PipelineResult<SandboxedPath> {
        self.path(name)?
            .ok_or_else(|| PipelineError::missing_argument(name))
    }

    fn derived_write(&mut self, relative: &str) -> PipelineResult<SandboxedPath> {
        let resolved = self.guard.resolve(relative)?;
        self.writes.push(resolved.clone());
        Ok(resolved)
    }

    fn count(&self, name: &str, fallback: i64) -> PipelineResult<usize> {
        let value = self.call.integer(name).unwrap_or(fallback);
        usize::try_from(value)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                PipelineError::invalid_argument(format!(
                    "argument `{name}` must be a positive integer, got {value}"
                ))
            })
    }

    fn strings(&self, name: &str) -> PipelineResult<Vec<String>> {
        let items = self
            .call
            .array(name)
            .ok_or_else(|| PipelineError::missing_argument(name))?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item.as_str().map(str::trim) {
                Some(text) if !text.is_empty() => out.push(text.to_owned()),
                _ => {
                    return Err(PipelineError::invalid_argument(format!(
                        "argument `{name}` must contain only non-empty strings"
                    )))
                }
            }
        }
        if out.is_empty() {
            return Err(PipelineError::invalid_argument(format!(
                "argument `{name}` must not be empty"
            )));
        }
        Ok(out)
    }

    fn object(&self, name: &str) -> Map<String, Value> {
        self.call.object(name).cloned().unwrap_or_default()
    }
}
