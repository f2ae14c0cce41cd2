//! Round envelopes: what the coordinator asks and what the client answers.

use crate::typing::{
    ClientId, DisconnectRes, ERROR_KEY, EvaluateIns, EvaluateRes, FitIns, FitRes,
    GetParametersIns, GetParametersRes, GetPropertiesIns, GetPropertiesRes, ReconnectIns,
};

/// One instruction addressed to one client.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Fit(FitIns),
    Evaluate(EvaluateIns),
    GetParameters(GetParametersIns),
    GetProperties(GetPropertiesIns),
    Reconnect(ReconnectIns),
    Stop,
}

impl Instruction {
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Fit(_) => "fit",
            Instruction::Evaluate(_) => "evaluate",
            Instruction::GetParameters(_) => "get_parameters",
            Instruction::GetProperties(_) => "get_properties",
            Instruction::Reconnect(_) => "reconnect",
            Instruction::Stop => "stop",
        }
    }
}

/// The client's answer to an `Instruction`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Fit(FitRes),
    Evaluate(EvaluateRes),
    GetParameters(GetParametersRes),
    GetProperties(GetPropertiesRes),
    Disconnect(DisconnectRes),
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Fit(_) => "fit",
            Reply::Evaluate(_) => "evaluate",
            Reply::GetParameters(_) => "get_parameters",
            Reply::GetProperties(_) => "get_properties",
            Reply::Disconnect(_) => "disconnect",
        }
    }

    /// Number of local samples behind this reply, zero for replies that don't
    /// carry a count.
    pub fn num_examples(&self) -> u64 {
        match self {
            Reply::Fit(res) => res.num_examples,
            Reply::Evaluate(res) => res.num_examples,
            _ => 0,
        }
    }

    /// The error marker of a degenerate result, if any.
    pub fn error_kind(&self) -> Option<&str> {
        let metrics = match self {
            Reply::Fit(res) => &res.metrics,
            Reply::Evaluate(res) => &res.metrics,
            _ => return None,
        };

        metrics.get(ERROR_KEY).and_then(|s| s.as_str())
    }
}

/// An instruction tagged with the round it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskIns {
    pub round: u64,
    pub instruction: Instruction,
}

/// A reply tagged with the sender and the round it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRes {
    pub client_id: ClientId,
    pub round: u64,
    pub reply: Reply,
}
