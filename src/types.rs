// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared data model: session lifecycle states, the persisted session row,
//! and the decimal-string amount encoding.
//!
//! Amounts are `U256` in memory. On the wire and in storage they are decimal
//! strings; a session's accrued balance additionally uses `"-1"` as the
//! "not yet initialized" sentinel, which maps to `None` in memory.

use crate::claim::ClaimTx;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current time in seconds since the unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Session lifecycle states.
///
/// `Failed` is reachable from every non-terminal state up to and including
/// `Claimable`; once claim submission begins the only terminal paths run
/// through the claim's own status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Unknown,
    Starting,
    Running,
    Claimable,
    Claiming,
    Finished,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Finished | SessionStatus::Failed)
    }

    /// Whether reward/penalty operations may still mutate the balance.
    pub fn balance_mutable(&self) -> bool {
        matches!(
            self,
            SessionStatus::Unknown | SessionStatus::Starting | SessionStatus::Running
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Unknown => "unknown",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Claimable => "claimable",
            SessionStatus::Claiming => "claiming",
            SessionStatus::Finished => "finished",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A task registered by a gating module that blocks session completion
/// until resolved or expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTask {
    /// Module that owns the task
    pub module: String,
    /// Task name, unique per module
    pub name: String,
    /// Deadline in epoch seconds; the task is dropped once this passes
    pub deadline: u64,
}

/// Persisted session row. This is the storage representation; live sessions
/// are rebuilt from it on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub status: SessionStatus,
    pub start_time: u64,
    pub remote_ip: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_addr: Option<Address>,
    #[serde(with = "opt_amount_dec")]
    pub drop_amount: Option<U256>,
    #[serde(default)]
    pub tasks: Vec<SessionTask>,
    /// Module-scoped key/value state, opaque to the core
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Claim blob; written atomically with the status flip to `Claiming`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub claim: Option<ClaimTx>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failed_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failed_reason: Option<String>,
}

impl SessionRecord {
    /// Externally visible balance: the sentinel reads as zero.
    pub fn visible_amount(&self) -> U256 {
        self.drop_amount.unwrap_or_default()
    }
}

/// Snapshot of claim queue progress, broadcast to subscribers on change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    /// Highest claim index that has left the queue (submitted or failed)
    pub processed_idx: u64,
    /// Highest claim index that has reached a terminal state
    pub confirmed_idx: u64,
}

/// Serde adapter: `U256` as a decimal string.
pub mod amount_dec {
    use ethers::types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<U256>` as a decimal string with `"-1"` for `None`.
pub mod opt_amount_dec {
    use ethers::types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_str("-1"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "-1" {
            return Ok(None);
        }
        U256::from_dec_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<U256>` as a nullable decimal string.
pub mod opt_amount_nullable {
    use ethers::types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        match opt {
            Some(s) => U256::from_dec_str(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(drop_amount: Option<U256>) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            status: SessionStatus::Running,
            start_time: 1_700_000_000,
            remote_ip: "10.0.0.1".to_string(),
            target_addr: None,
            drop_amount,
            tasks: vec![],
            data: HashMap::new(),
            claim: None,
            failed_code: None,
            failed_reason: None,
        }
    }

    #[test]
    fn test_amount_serialized_as_decimal_string() {
        let rec = record(Some(U256::from(1_000_000_000_000_000_000u64)));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["drop_amount"], "1000000000000000000");

        let back: SessionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.drop_amount, rec.drop_amount);
    }

    #[test]
    fn test_uninitialized_amount_sentinel() {
        let rec = record(None);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["drop_amount"], "-1");

        let back: SessionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.drop_amount, None);
        // The sentinel is never visible as a negative balance
        assert_eq!(back.visible_amount(), U256::zero());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Claiming).unwrap(),
            "claiming"
        );
        assert_eq!(
            serde_json::to_value(SessionStatus::Claimable).unwrap(),
            "claimable"
        );
        let status: SessionStatus = serde_json::from_value("failed".into()).unwrap();
        assert_eq!(status, SessionStatus::Failed);
    }

    #[test]
    fn test_balance_mutability_by_status() {
        assert!(SessionStatus::Running.balance_mutable());
        assert!(!SessionStatus::Claiming.balance_mutable());
        assert!(!SessionStatus::Finished.balance_mutable());
        assert!(!SessionStatus::Failed.balance_mutable());
    }
}
