//! Module-command subsystem (§4.7): a per-module local reply service backed
//! by a persistent process table, plus the CLI-facing requestor.
//!
//! Grounded in `examples/jwilger-caxton`'s `sqlx`-backed repository pattern
//! (`storage.rs`) for `ProcessTable`, and in `crate::socket::reqrep` for the
//! reply/request plumbing. The upsert-on-initialize policy for stale rows is
//! the explicit §9 decision: no heartbeat, no silent cure.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::message::{
    AnyMessage, AvailableCommandsRequest, AvailableCommandsResponse, CommandRequest,
    CommandResponse, Message, TerminateRequest, TerminateResponse,
};
use crate::socket::reqrep::{Reply, Request};
use crate::socket::{ConnectOrBind, SocketOptions};
use crate::transport::Context;
use crate::zap::Role;

/// Module-command subsystem errors.
#[derive(Error, Debug)]
pub enum CommandError {
    /// A socket-level failure while serving or issuing module commands.
    #[error(transparent)]
    Socket(#[from] crate::socket::SocketError),

    /// The process table could not be read or written.
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    /// The module replied with a `Failure` message.
    #[error("module command failed: {0}")]
    Failed(String),

    /// The module returned an unexpected reply type.
    #[error("unexpected reply from module")]
    UnexpectedReply,
}

/// Outcome of processing a module command (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i64)]
pub enum CommandReturnCode {
    /// The command was processed successfully.
    Success = 0,
    /// The command text was not recognised by the module.
    InvalidCommand = 1,
    /// The command was recognised but failed while executing.
    ApplicationError = 2,
}

/// Liveness as last observed via the process table (not the reply socket
/// itself — a crashed module's row can outlive its process, see §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApplicationStatus {
    /// The module is believed to be running.
    Running,
    /// The module reported it is paused.
    Paused,
    /// No status has been recorded.
    Unknown,
    /// The module has cleanly deregistered.
    NotRunning,
}

/// `(module_name, ipc_file_path, process_identifier, application_status)` —
/// one row of the process table (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LocalModuleDetails {
    /// The module's unique name; also the process table's primary key.
    pub module_name: String,
    /// `ipc_directory / "<module_name>.ipc"`.
    pub ipc_file_path: PathBuf,
    /// The OS process id that last wrote this row.
    pub process_identifier: u32,
    /// Last-known application status.
    pub application_status: ApplicationStatus,
}

fn status_to_i64(status: ApplicationStatus) -> i64 {
    match status {
        ApplicationStatus::Running => 0,
        ApplicationStatus::Paused => 1,
        ApplicationStatus::Unknown => 2,
        ApplicationStatus::NotRunning => 3,
    }
}

fn status_from_i64(value: i64) -> ApplicationStatus {
    match value {
        0 => ApplicationStatus::Running,
        1 => ApplicationStatus::Paused,
        3 => ApplicationStatus::NotRunning,
        _ => ApplicationStatus::Unknown,
    }
}

/// The persistent, single-row-per-module key-value store backing module
/// discovery (§3). Opened read-write by the module itself, read-only by
/// discovery clients.
pub struct ProcessTable {
    pool: sqlx::SqlitePool,
}

impl ProcessTable {
    /// Wrap an already-migrated connection pool.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the row for `details.module_name`, unconditionally
    /// — a crashed-then-restarted module self-heals its own entry this way;
    /// a module that never restarts leaves its stale row in place forever,
    /// exactly as the source this is ported from (§9).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the upsert fails.
    pub async fn upsert(&self, details: &LocalModuleDetails) -> Result<(), CommandError> {
        sqlx::query(
            "INSERT INTO local_modules (module, ipc_file, process_identifier, status) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(module) DO UPDATE SET ipc_file = excluded.ipc_file, \
             process_identifier = excluded.process_identifier, status = excluded.status",
        )
        .bind(&details.module_name)
        .bind(details.ipc_file_path.to_string_lossy().to_string())
        .bind(details.process_identifier as i64)
        .bind(status_to_i64(details.application_status))
        .execute(&self.pool)
        .await
        .map_err(|e| CommandError::Storage(crate::storage::StorageError::from(e)))?;
        Ok(())
    }

    /// Delete the row for `module_name` (clean shutdown path).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the delete fails.
    pub async fn delete(&self, module_name: &str) -> Result<(), CommandError> {
        sqlx::query("DELETE FROM local_modules WHERE module = ?1")
            .bind(module_name)
            .execute(&self.pool)
            .await
            .map_err(|e| CommandError::Storage(crate::storage::StorageError::from(e)))?;
        Ok(())
    }

    /// List every row currently in the table, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub async fn list(&self) -> Result<Vec<LocalModuleDetails>, CommandError> {
        let rows = sqlx::query_as::<_, ProcessTableRow>(
            "SELECT module, ipc_file, process_identifier, status FROM local_modules",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CommandError::Storage(crate::storage::StorageError::from(e)))?;
        Ok(rows.into_iter().map(LocalModuleDetails::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ProcessTableRow {
    module: String,
    ipc_file: Option<String>,
    process_identifier: Option<i64>,
    status: i64,
}

impl From<ProcessTableRow> for LocalModuleDetails {
    fn from(row: ProcessTableRow) -> Self {
        Self {
            module_name: row.module,
            ipc_file_path: row.ipc_file.map(PathBuf::from).unwrap_or_default(),
            process_identifier: row.process_identifier.unwrap_or_default().max(0) as u32,
            application_status: status_from_i64(row.status),
        }
    }
}

/// Build `ipc_directory / "<module_name>.ipc"` and its `ipc://` address.
fn ipc_file_path(ipc_directory: &Path, module_name: &str) -> PathBuf {
    ipc_directory.join(format!("{module_name}.ipc"))
}

fn ipc_address(ipc_directory: &Path, module_name: &str) -> String {
    format!("ipc://{}", ipc_file_path(ipc_directory, module_name).display())
}

/// A callback invoked for every `CommandRequest`: `(command_text) ->
/// (response_text, return_code)`.
pub type CommandCallback = Box<dyn Fn(&str) -> (String, CommandReturnCode) + Send + Sync>;

/// Per-module local reply service: binds `ipc://<ipc_dir>/<module_name>.ipc`,
/// registers/deregisters itself in the [`ProcessTable`], and dispatches
/// `AvailableCommandsRequest`/`CommandRequest`/`TerminateRequest`.
pub struct LocalService {
    context: Context,
    module_name: String,
    ipc_directory: PathBuf,
    help_text: String,
    reply: Reply,
    process_table: ProcessTable,
}

impl LocalService {
    /// A not-yet-initialized service for `module_name`, answering
    /// `AvailableCommandsRequest` with `help_text`.
    pub fn new(
        context: Context,
        process_table: ProcessTable,
        module_name: impl Into<String>,
        ipc_directory: impl Into<PathBuf>,
        help_text: impl Into<String>,
    ) -> Self {
        Self {
            reply: Reply::new(context.clone()),
            context,
            module_name: module_name.into(),
            ipc_directory: ipc_directory.into(),
            help_text: help_text.into(),
            process_table,
        }
    }

    /// Bind the module's IPC reply socket and upsert its row in the process
    /// table (§9: unconditional upsert, no heartbeat).
    ///
    /// # Errors
    ///
    /// Propagates a socket or storage error.
    pub async fn initialize(&mut self) -> Result<(), CommandError> {
        let address = ipc_address(&self.ipc_directory, &self.module_name);
        self.reply.initialize(SocketOptions::new(
            address.clone(),
            ConnectOrBind::Bind,
            Role::Server,
        ))?;
        self.process_table
            .upsert(&LocalModuleDetails {
                module_name: self.module_name.clone(),
                ipc_file_path: ipc_file_path(&self.ipc_directory, &self.module_name),
                process_identifier: std::process::id(),
                application_status: ApplicationStatus::Running,
            })
            .await?;
        info!(module = %self.module_name, %address, "local command service initialized");
        Ok(())
    }

    /// Run the dispatch loop until a `TerminateRequest` is handled or
    /// [`LocalService::stop`] is called externally.
    ///
    /// # Errors
    ///
    /// Propagates a socket error from the underlying reply loop.
    pub async fn start(&mut self, callback: CommandCallback) -> Result<(), CommandError> {
        let help_text = self.help_text.clone();
        self.reply
            .start(move |type_name, payload| match type_name {
                t if t == AvailableCommandsRequest::TYPE_NAME => {
                    Ok(AnyMessage::AvailableCommandsResponse(AvailableCommandsResponse {
                        help_text: help_text.clone(),
                    }))
                }
                t if t == CommandRequest::TYPE_NAME => {
                    let request = CommandRequest::from_wire(payload).map_err(|e| e.to_string())?;
                    let (response, return_code) = callback(&request.command);
                    Ok(AnyMessage::CommandResponse(CommandResponse {
                        response,
                        return_code,
                    }))
                }
                t if t == TerminateRequest::TYPE_NAME => {
                    Ok(AnyMessage::TerminateResponse(TerminateResponse {
                        return_code: CommandReturnCode::Success,
                    }))
                }
                other => Err(format!("unsupported request type: {other}")),
            })
            .await?;
        Ok(())
    }

    /// Stop the dispatch loop after its current iteration.
    pub fn stop(&mut self) {
        self.reply.stop();
    }

    /// Delete this module's process-table row (clean shutdown path).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the delete fails.
    pub async fn deregister(&self) -> Result<(), CommandError> {
        self.process_table.delete(&self.module_name).await?;
        debug!(module = %self.module_name, "deregistered from process table");
        Ok(())
    }

    /// The context this service's socket was opened on, exposed so callers
    /// composing several local services can share one transport.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Default timeout for `LocalRequestor` calls: the CLI is expected to retry
/// on user command rather than wait out a long deadline (§4.7).
const LOCAL_REQUESTOR_TIMEOUT_MS: i32 = 10;

/// CLI-side access to one module's command service.
pub struct LocalRequestor {
    request: Request,
}

impl LocalRequestor {
    /// A not-yet-connected requestor.
    pub fn new(context: Context) -> Self {
        Self {
            request: Request::new(context, crate::message::MessageRegistry::with_builtin_types()),
        }
    }

    /// Connect to `module_name`'s reply socket under `ipc_directory`, with
    /// the 10 ms default receive timeout.
    ///
    /// # Errors
    ///
    /// Propagates a socket error from the underlying `Request::initialize`.
    pub fn initialize(&mut self, ipc_directory: &Path, module_name: &str) -> Result<(), CommandError> {
        let address = ipc_address(ipc_directory, module_name);
        self.request.initialize(
            SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                .with_timeouts(LOCAL_REQUESTOR_TIMEOUT_MS, LOCAL_REQUESTOR_TIMEOUT_MS),
        )?;
        Ok(())
    }

    /// Fetch the module's static help text.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failed`] on a `Failure` reply, or
    /// [`CommandError::UnexpectedReply`] for any other unexpected shape.
    pub async fn available_commands(&mut self) -> Result<String, CommandError> {
        match self.request.request(&AvailableCommandsRequest::default()).await? {
            AnyMessage::AvailableCommandsResponse(response) => Ok(response.help_text),
            AnyMessage::Failure(failure) => Err(CommandError::Failed(failure.details)),
            _ => Err(CommandError::UnexpectedReply),
        }
    }

    /// Issue a module-specific command line and return its response text and
    /// return code.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failed`] on a `Failure` reply, or
    /// [`CommandError::UnexpectedReply`] for any other unexpected shape.
    pub async fn command(&mut self, command: &str) -> Result<(String, CommandReturnCode), CommandError> {
        match self
            .request
            .request(&CommandRequest {
                command: command.to_string(),
            })
            .await?
        {
            AnyMessage::CommandResponse(response) => Ok((response.response, response.return_code)),
            AnyMessage::Failure(failure) => Err(CommandError::Failed(failure.details)),
            _ => Err(CommandError::UnexpectedReply),
        }
    }

    /// Ask the module to shut down after replying.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failed`] on a `Failure` reply, or
    /// [`CommandError::UnexpectedReply`] for any other unexpected shape.
    pub async fn terminate(&mut self) -> Result<CommandReturnCode, CommandError> {
        match self.request.request(&TerminateRequest::default()).await? {
            AnyMessage::TerminateResponse(response) => Ok(response.return_code),
            AnyMessage::Failure(failure) => Err(CommandError::Failed(failure.details)),
            _ => Err(CommandError::UnexpectedReply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DatabaseConfig, DatabaseConnection, DatabasePath};

    async fn process_table() -> ProcessTable {
        let path = DatabasePath::new(":memory:").expect("valid path");
        let config = DatabaseConfig::for_testing(path);
        let conn = DatabaseConnection::initialize(config).await.expect("db init");
        ProcessTable::new(conn.pool().clone())
    }

    fn sample_row(name: &str, status: ApplicationStatus) -> LocalModuleDetails {
        LocalModuleDetails {
            module_name: name.to_string(),
            ipc_file_path: PathBuf::from(format!("/tmp/{name}.ipc")),
            process_identifier: 4242,
            application_status: status,
        }
    }

    #[tokio::test]
    async fn upsert_then_list_round_trips_a_row() {
        let table = process_table().await;
        table.upsert(&sample_row("picker", ApplicationStatus::Running)).await.unwrap();
        let rows = table.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].module_name, "picker");
        assert_eq!(rows[0].application_status, ApplicationStatus::Running);
    }

    #[tokio::test]
    async fn upsert_overwrites_a_stale_row_unconditionally() {
        let table = process_table().await;
        table.upsert(&sample_row("detector", ApplicationStatus::Running)).await.unwrap();
        table.upsert(&sample_row("detector", ApplicationStatus::Running)).await.unwrap();
        let rows = table.list().await.unwrap();
        assert_eq!(rows.len(), 1, "second upsert must overwrite, not duplicate");
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let table = process_table().await;
        table.upsert(&sample_row("counter", ApplicationStatus::Running)).await.unwrap();
        table.delete("counter").await.unwrap();
        assert!(table.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_service_initialize_registers_and_stop_leaves_row_until_deregister() {
        let context = Context::new();
        let table = process_table().await;
        let dir = std::env::temp_dir();
        let mut service = LocalService::new(context, table, "test-module", dir, "test help");
        service.initialize().await.unwrap();

        let rows = service.process_table.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].module_name, "test-module");

        service.deregister().await.unwrap();
        assert!(service.process_table.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_round_trips_through_local_service_and_requestor() {
        let context = Context::new();
        let table = process_table().await;
        let dir = std::env::temp_dir();
        let ipc_path = ipc_file_path(&dir, "echo-module");
        let _ = std::fs::remove_file(&ipc_path);

        let mut service = LocalService::new(context.clone(), table, "echo-module", dir.clone(), "echoes commands");
        service.initialize().await.unwrap();

        let server = tokio::spawn(async move {
            service
                .start(Box::new(|command| (command.to_string(), CommandReturnCode::Success)))
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut requestor = LocalRequestor::new(context);
        requestor.initialize(&dir, "echo-module").unwrap();

        let help = requestor.available_commands().await.unwrap();
        assert_eq!(help, "echoes commands");

        let (response, code) = requestor.command("status").await.unwrap();
        assert_eq!(response, "status");
        assert_eq!(code, CommandReturnCode::Success);

        server.abort();
        let _ = std::fs::remove_file(&ipc_path);
    }
}
