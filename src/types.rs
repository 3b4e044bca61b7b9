use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account kind in the SYS -> VLAB -> PROJ -> RSV hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Sys,
    Vlab,
    Proj,
    Rsv,
}

impl AccountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sys => "SYS",
            Self::Vlab => "VLAB",
            Self::Proj => "PROJ",
            Self::Rsv => "RSV",
        }
    }
}

impl std::str::FromStr for AccountKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SYS" => Ok(Self::Sys),
            "VLAB" => Ok(Self::Vlab),
            "PROJ" => Ok(Self::Proj),
            "RSV" => Ok(Self::Rsv),
            other => Err(format!("unknown account kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Oneshot,
    Longrun,
    Storage,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Oneshot => "ONESHOT",
            Self::Longrun => "LONGRUN",
            Self::Storage => "STORAGE",
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ONESHOT" => Ok(Self::Oneshot),
            "LONGRUN" => Ok(Self::Longrun),
            "STORAGE" => Ok(Self::Storage),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}

/// Service subtype is a caller-provided label (e.g. a compute flavour or
/// storage class) scoped within a service type. Kept as an owned string
/// rather than a closed enum: the price catalog is the source of truth for
/// which subtypes are billable, not the type system.
pub type ServiceSubtype = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    TopUp,
    AssignBudget,
    ReverseBudget,
    MoveBudget,
    Reserve,
    Release,
    ChargeOneshot,
    ChargeLongrun,
    ChargeStorage,
    Refund,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopUp => "TOP_UP",
            Self::AssignBudget => "ASSIGN_BUDGET",
            Self::ReverseBudget => "REVERSE_BUDGET",
            Self::MoveBudget => "MOVE_BUDGET",
            Self::Reserve => "RESERVE",
            Self::Release => "RELEASE",
            Self::ChargeOneshot => "CHARGE_ONESHOT",
            Self::ChargeLongrun => "CHARGE_LONGRUN",
            Self::ChargeStorage => "CHARGE_STORAGE",
            Self::Refund => "REFUND",
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "TOP_UP" => Ok(Self::TopUp),
            "ASSIGN_BUDGET" => Ok(Self::AssignBudget),
            "REVERSE_BUDGET" => Ok(Self::ReverseBudget),
            "MOVE_BUDGET" => Ok(Self::MoveBudget),
            "RESERVE" => Ok(Self::Reserve),
            "RELEASE" => Ok(Self::Release),
            "CHARGE_ONESHOT" => Ok(Self::ChargeOneshot),
            "CHARGE_LONGRUN" => Ok(Self::ChargeLongrun),
            "CHARGE_STORAGE" => Ok(Self::ChargeStorage),
            "REFUND" => Ok(Self::Refund),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

pub type AccountId = Uuid;
pub type JobId = Uuid;
pub type Timestamp = DateTime<Utc>;
