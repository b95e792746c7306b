use serde::{Deserialize, Serialize};
use std::fmt;

pub type PlayerId = i64;
pub type FactionId = i64;
pub type ItemId = i64;
pub type EffectId = i64;
pub type ContractId = i64;
pub type DebtId = i64;

/// Lifecycle of a contract row. Only `Signed` contracts carry a live timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Pending,
    Signed,
    Completed,
    Terminated,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Pending => "pending",
            ContractStatus::Signed => "signed",
            ContractStatus::Completed => "completed",
            ContractStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ContractStatus::Pending),
            "signed" => Ok(ContractStatus::Signed),
            "completed" => Ok(ContractStatus::Completed),
            "terminated" => Ok(ContractStatus::Terminated),
            other => Err(format!("unknown contract status: {other}")),
        }
    }
}

/// Reward shape of a contract.
///
/// `Type1` pays both parties and may grant the customer a faction item;
/// `Type2` pays only the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Type1,
    Type2,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Type1 => "type1",
            ContractKind::Type2 => "type2",
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContractKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "type1" => Ok(ContractKind::Type1),
            "type2" => Ok(ContractKind::Type2),
            other => Err(format!("unknown contract type: {other}")),
        }
    }
}

/// What an item effect does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    GenerateMoney,
    GenerateInfluence,
    SpawnItem,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::GenerateMoney => "generate_money",
            EffectKind::GenerateInfluence => "generate_influence",
            EffectKind::SpawnItem => "spawn_item",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EffectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate_money" => Ok(EffectKind::GenerateMoney),
            "generate_influence" => Ok(EffectKind::GenerateInfluence),
            "spawn_item" => Ok(EffectKind::SpawnItem),
            other => Err(format!("unknown effect type: {other}")),
        }
    }
}

/// Operation attached to a resource-generating effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
}

impl Operation {
    /// Signed delta applied to the balance for an effect `value`.
    ///
    /// `Mul` and `Div` pass the value through unchanged, same as `Add`. This is
    /// the live game's behaviour and is kept as-is until product decides what
    /// multiplying a balance per tick should mean.
    pub fn delta(self, value: i64) -> i64 {
        match self {
            Operation::Add => value,
            Operation::Sub => -value,
            Operation::Mul => value,
            Operation::Div => value,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Sub => "sub",
            Operation::Mul => "mul",
            Operation::Div => "div",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Operation::Add),
            "sub" => Ok(Operation::Sub),
            "mul" => Ok(Operation::Mul),
            "div" => Ok(Operation::Div),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Phase of the latest game timeline row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    NotStarted,
    Running,
    Ended,
}
