//! Operation kinds and priority classes.
//!
//! Operation codes are meaningful only to collaborators; the bridge itself
//! consults just the table in [`Operation::traits`] to decide the default
//! priority class and whether a request is voided on subprocess restart.

use serde::{Deserialize, Serialize};

/// Priority class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Interactive caller blocked on the answer
    Sync,
    /// Ordinary bulk throughput, subject to admission control
    Standard,
    /// Re-submission triggered by the resolver itself
    Redo,
    /// Background work with no caller waiting
    Deferred,
}

/// Closed set of operations the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    NoOp,
    AddRecord,
    DeleteRecord,
    ReevaluateRecord,
    ReevaluateEntity,
    ProcessRedo,
    GetEntity,
    FindPath,
    FindNetwork,
    WhyRecords,
    HowEntity,
    Stats,
    ExportOpen,
    ExportFetchNext,
    ExportClose,
}

/// Handling strategy for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTraits {
    pub default_class: PriorityClass,
    /// Void rather than retry when the subprocess incarnation changes
    pub cancel_on_restart: bool,
}

impl Operation {
    /// Handling strategy table.
    pub const fn traits(self) -> OperationTraits {
        let (default_class, cancel_on_restart) = match self {
            Operation::NoOp => (PriorityClass::Sync, false),
            Operation::AddRecord
            | Operation::DeleteRecord
            | Operation::ReevaluateRecord
            | Operation::ReevaluateEntity => (PriorityClass::Standard, false),
            Operation::ProcessRedo => (PriorityClass::Redo, false),
            Operation::GetEntity
            | Operation::FindPath
            | Operation::FindNetwork
            | Operation::WhyRecords
            | Operation::HowEntity => (PriorityClass::Sync, false),
            Operation::Stats => (PriorityClass::Deferred, false),
            // Export handles live inside one subprocess incarnation.
            Operation::ExportOpen => (PriorityClass::Sync, false),
            Operation::ExportFetchNext | Operation::ExportClose => (PriorityClass::Sync, true),
        };
        OperationTraits {
            default_class,
            cancel_on_restart,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::NoOp => "no_op",
            Operation::AddRecord => "add_record",
            Operation::DeleteRecord => "delete_record",
            Operation::ReevaluateRecord => "reevaluate_record",
            Operation::ReevaluateEntity => "reevaluate_entity",
            Operation::ProcessRedo => "process_redo",
            Operation::GetEntity => "get_entity",
            Operation::FindPath => "find_path",
            Operation::FindNetwork => "find_network",
            Operation::WhyRecords => "why_records",
            Operation::HowEntity => "how_entity",
            Operation::Stats => "stats",
            Operation::ExportOpen => "export_open",
            Operation::ExportFetchNext => "export_fetch_next",
            Operation::ExportClose => "export_close",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
