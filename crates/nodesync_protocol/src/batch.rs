//! Batch ledger rows and the batch state machine.

use crate::error::ProtocolError;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Batch identifier, assigned once from the `outgoing_batch` sequence.
pub type BatchId = u64;

/// SQL state recorded when a row conflicted with the target.
pub const CONFLICT_STATE: &str = "CONFLICT";

/// SQL state recorded on a foreign-key violation.
pub const FK_VIOLATION_STATE: &str = "FK_VIOLATION";

/// SQL state recorded when the target database reported a deadlock.
pub const DEADLOCK_STATE: &str = "DEADLOCK";

/// Returns true for failures that are not the sending node's fault.
///
/// Conflicts, deadlocks and foreign-key violations usually resolve on retry,
/// so they put a batch in `ER` without raising its error flag.
pub fn is_benign_sql_state(state: Option<&str>) -> bool {
    matches!(
        state,
        Some(CONFLICT_STATE) | Some(FK_VIOLATION_STATE) | Some(DEADLOCK_STATE)
    )
}

/// Status of a batch in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Reserved for an extract request, not yet extracted.
    #[serde(rename = "RQ")]
    Requested,
    /// Routed and ready to extract.
    #[serde(rename = "NE")]
    New,
    /// Being extracted to staging.
    #[serde(rename = "QY")]
    Querying,
    /// Being streamed to the remote node.
    #[serde(rename = "SE")]
    Sending,
    /// Delivered; the remote is loading it.
    #[serde(rename = "LD")]
    Loading,
    /// Loaded successfully.
    #[serde(rename = "OK")]
    Ok,
    /// Failed to load.
    #[serde(rename = "ER")]
    Error,
    /// Ignored by an operator.
    #[serde(rename = "IG")]
    Ignored,
    /// Queued for resend.
    #[serde(rename = "RS")]
    Resend,
    /// Still being routed.
    #[serde(rename = "RT")]
    Routing,
}

impl BatchStatus {
    /// Statuses of outgoing batches that still have to reach the remote.
    pub const PENDING: [BatchStatus; 8] = [
        BatchStatus::Requested,
        BatchStatus::New,
        BatchStatus::Querying,
        BatchStatus::Sending,
        BatchStatus::Loading,
        BatchStatus::Error,
        BatchStatus::Ignored,
        BatchStatus::Resend,
    ];

    /// Returns the two-letter ledger code.
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::Requested => "RQ",
            BatchStatus::New => "NE",
            BatchStatus::Querying => "QY",
            BatchStatus::Sending => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
            BatchStatus::Ignored => "IG",
            BatchStatus::Resend => "RS",
            BatchStatus::Routing => "RT",
        }
    }

    /// Returns true if the batch still has to be delivered.
    pub fn is_pending(&self) -> bool {
        Self::PENDING.contains(self)
    }

    /// Returns true if delivery reached a final outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Ok)
    }

    /// Returns true if the batch was handed to the remote and may have been
    /// loaded without the local ledger knowing.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BatchStatus::Sending | BatchStatus::Loading)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for BatchStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RQ" => Ok(BatchStatus::Requested),
            "NE" => Ok(BatchStatus::New),
            "QY" => Ok(BatchStatus::Querying),
            "SE" => Ok(BatchStatus::Sending),
            "LD" => Ok(BatchStatus::Loading),
            "OK" => Ok(BatchStatus::Ok),
            "ER" => Ok(BatchStatus::Error),
            "IG" => Ok(BatchStatus::Ignored),
            "RS" => Ok(BatchStatus::Resend),
            "RT" => Ok(BatchStatus::Routing),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// A ledger row for one batch, outgoing or incoming.
///
/// For outgoing batches `node_id` is the target node; for incoming batches it
/// is the node the batch came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch id.
    pub batch_id: BatchId,
    /// Target (outgoing) or source (incoming) node.
    pub node_id: String,
    /// Channel the batch was routed on.
    pub channel_id: String,
    /// Current status.
    pub status: BatchStatus,
    /// Load this batch belongs to, if it is part of a reload.
    pub load_id: Option<u64>,
    /// Staged payload size.
    pub byte_count: u64,
    /// Number of data rows.
    pub row_count: u64,
    /// Insert events.
    pub insert_count: u64,
    /// Update events.
    pub update_count: u64,
    /// Delete events.
    pub delete_count: u64,
    /// Times the batch was extracted.
    pub extract_count: u32,
    /// Times the batch was sent.
    pub sent_count: u32,
    /// Times the batch was handed over for loading.
    pub load_count: u32,
    /// Whether the failure is attributed to this node.
    pub error_flag: bool,
    /// Whether this is a re-attempt of an earlier delivery.
    pub retry_flag: bool,
    /// Redundant deliveries that were skipped.
    pub skip_count: u32,
    /// Times the batch was ignored.
    pub ignore_count: u32,
    /// Row within the batch that failed (1-based, 0 if none).
    pub failed_row_number: u64,
    /// Line reported by the receiver for the failure.
    pub failed_line_number: u64,
    /// Capture id of the failed row.
    pub failed_data_id: u64,
    /// SQL state of the last failure.
    pub sql_state: Option<String>,
    /// SQL code of the last failure.
    pub sql_code: i32,
    /// Message of the last failure.
    pub sql_message: Option<String>,
    /// Time spent on the network.
    pub network_millis: u64,
    /// Time spent filtering on the receiver.
    pub filter_millis: u64,
    /// Time spent in the target database.
    pub database_millis: u64,
    /// Time spent extracting.
    pub extract_millis: u64,
    /// Host that last wrote the row.
    pub last_update_host: Option<String>,
    /// When the row was last written.
    pub last_update_time: Option<Timestamp>,
    /// When the row was created.
    pub create_time: Option<Timestamp>,
}

impl Batch {
    /// Creates a batch with zeroed counters.
    pub fn new(
        batch_id: BatchId,
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        status: BatchStatus,
    ) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status,
            load_id: None,
            byte_count: 0,
            row_count: 0,
            insert_count: 0,
            update_count: 0,
            delete_count: 0,
            extract_count: 0,
            sent_count: 0,
            load_count: 0,
            error_flag: false,
            retry_flag: false,
            skip_count: 0,
            ignore_count: 0,
            failed_row_number: 0,
            failed_line_number: 0,
            failed_data_id: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            network_millis: 0,
            filter_millis: 0,
            database_millis: 0,
            extract_millis: 0,
            last_update_host: None,
            last_update_time: None,
            create_time: None,
        }
    }

    /// Sets the load id.
    pub fn with_load_id(mut self, load_id: u64) -> Self {
        self.load_id = Some(load_id);
        self
    }

    /// Returns true if the batch belongs to a reload.
    pub fn is_load_batch(&self) -> bool {
        self.load_id.is_some()
    }

    /// Recomputes `error_flag` from the status and sql state.
    pub fn derive_error_flag(&mut self) {
        self.error_flag =
            self.status == BatchStatus::Error && !is_benign_sql_state(self.sql_state.as_deref());
    }

    /// Clears the diagnostics of a previous failure.
    pub fn clear_error(&mut self) {
        self.error_flag = false;
        self.sql_state = None;
        self.sql_code = 0;
        self.sql_message = None;
        self.failed_row_number = 0;
        self.failed_line_number = 0;
        self.failed_data_id = 0;
    }

    /// Copies load timing and size statistics from another row.
    pub fn copy_statistics_from(&mut self, other: &Batch) {
        self.byte_count = other.byte_count;
        self.row_count = other.row_count;
        self.insert_count = other.insert_count;
        self.update_count = other.update_count;
        self.delete_count = other.delete_count;
        self.network_millis = other.network_millis;
        self.filter_millis = other.filter_millis;
        self.database_millis = other.database_millis;
    }

    /// Returns `"<node_id>-<batch_id>"` for logs.
    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.node_id, self.batch_id)
    }
}
