//! Binary layout of instruction and reply frames.
//!
//! ```text
//! [u32 meta_len][meta_len bytes of JSON][u64 len][blob 0]...[u64 len][blob n-1]
//! ```
//!
//! The JSON metadata holds every field but the tensor blobs, which are
//! appended raw so parameters are never inflated by a text encoding.

use std::io;

use serde::{Deserialize, Serialize};

use crate::{
    task::{Instruction, Reply, TaskIns, TaskRes},
    typing::{
        ClientId, Config, DisconnectRes, EvaluateIns, EvaluateRes, FitIns, FitRes,
        GetParametersIns, GetParametersRes, GetPropertiesIns, GetPropertiesRes, Metrics,
        Parameters, Properties, ReconnectIns, nan_as_null,
    },
};

type MetaLen = u32;
type BlobLen = u64;

#[derive(Debug, Serialize, Deserialize)]
struct ParamsMeta {
    tensor_type: String,
    count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum InstructionMeta {
    Fit { params: ParamsMeta, config: Config },
    Evaluate { params: ParamsMeta, config: Config },
    GetParameters { config: Config },
    GetProperties { config: Config },
    Reconnect { seconds: u64 },
    Stop,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskInsMeta {
    round: u64,
    instruction: InstructionMeta,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ReplyMeta {
    Fit {
        params: ParamsMeta,
        num_examples: u64,
        metrics: Metrics,
    },
    Evaluate {
        #[serde(with = "nan_as_null")]
        loss: f64,
        num_examples: u64,
        metrics: Metrics,
    },
    GetParameters {
        params: ParamsMeta,
    },
    GetProperties {
        properties: Properties,
    },
    Disconnect {
        reason: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskResMeta {
    client_id: ClientId,
    round: u64,
    reply: ReplyMeta,
}

fn params_meta(params: &Parameters) -> ParamsMeta {
    ParamsMeta {
        tensor_type: params.tensor_type.clone(),
        count: params.tensors.len(),
    }
}

fn invalid<T>(detail: impl Into<String>) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, detail.into()))
}

/// Writes the metadata and the blobs after whatever `buf` already holds.
fn write<M: Serialize>(buf: &mut Vec<u8>, meta: &M, params: Option<&Parameters>) -> io::Result<()> {
    let start = buf.len();
    buf.extend_from_slice(&[0; size_of::<MetaLen>()]);

    serde_json::to_writer(&mut *buf, meta)?;

    let meta_len = buf.len() - start - size_of::<MetaLen>();
    let meta_len = MetaLen::try_from(meta_len)
        .or_else(|_| invalid(format!("envelope metadata of {meta_len} bytes is too large")))?;

    buf[start..start + size_of::<MetaLen>()].copy_from_slice(&meta_len.to_be_bytes());

    for blob in params.map(|p| p.tensors.as_slice()).unwrap_or_default() {
        buf.extend_from_slice(&(blob.len() as BlobLen).to_be_bytes());
        buf.extend_from_slice(blob);
    }

    Ok(())
}

/// A bounds checked view over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return invalid(format!(
                "truncated envelope: {what} needs {n} bytes, {} left",
                self.buf.len()
            ));
        }

        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn meta_len(&mut self) -> io::Result<usize> {
        let bytes = self.take(size_of::<MetaLen>(), "metadata length")?;
        let mut raw = [0; size_of::<MetaLen>()];
        raw.copy_from_slice(bytes);
        Ok(MetaLen::from_be_bytes(raw) as usize)
    }

    fn blob(&mut self, index: usize) -> io::Result<Vec<u8>> {
        let bytes = self.take(size_of::<BlobLen>(), "blob length")?;
        let mut raw = [0; size_of::<BlobLen>()];
        raw.copy_from_slice(bytes);

        let len = usize::try_from(BlobLen::from_be_bytes(raw))
            .or_else(|_| invalid(format!("blob {index} length does not fit in memory")))?;

        Ok(self.take(len, "blob")?.to_vec())
    }

    fn params(&mut self, meta: ParamsMeta) -> io::Result<Parameters> {
        // Every blob needs at least its length prefix, a larger count is a lie.
        if meta.count > self.buf.len() / size_of::<BlobLen>() {
            return invalid(format!(
                "envelope announces {} blobs but only {} bytes follow",
                meta.count,
                self.buf.len()
            ));
        }

        let tensors = (0..meta.count)
            .map(|i| self.blob(i))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Parameters::new(tensors, meta.tensor_type))
    }

    fn finish(self) -> io::Result<()> {
        if !self.buf.is_empty() {
            return invalid(format!("{} trailing bytes after envelope", self.buf.len()));
        }
        Ok(())
    }
}

/// Splits a frame body into its parsed metadata and a reader over the blobs.
fn read<'a, M: Deserialize<'a>>(buf: &'a [u8]) -> io::Result<(M, Reader<'a>)> {
    let mut reader = Reader { buf };
    let meta_len = reader.meta_len()?;
    let meta = reader.take(meta_len, "metadata")?;
    let meta = serde_json::from_slice(meta)?;
    Ok((meta, reader))
}

pub(crate) fn write_task_ins(buf: &mut Vec<u8>, task: &TaskIns) -> io::Result<()> {
    let (instruction, params) = match &task.instruction {
        Instruction::Fit(ins) => (
            InstructionMeta::Fit {
                params: params_meta(&ins.parameters),
                config: ins.config.clone(),
            },
            Some(&ins.parameters),
        ),
        Instruction::Evaluate(ins) => (
            InstructionMeta::Evaluate {
                params: params_meta(&ins.parameters),
                config: ins.config.clone(),
            },
            Some(&ins.parameters),
        ),
        Instruction::GetParameters(ins) => (
            InstructionMeta::GetParameters {
                config: ins.config.clone(),
            },
            None,
        ),
        Instruction::GetProperties(ins) => (
            InstructionMeta::GetProperties {
                config: ins.config.clone(),
            },
            None,
        ),
        Instruction::Reconnect(ins) => (
            InstructionMeta::Reconnect {
                seconds: ins.seconds,
            },
            None,
        ),
        Instruction::Stop => (InstructionMeta::Stop, None),
    };

    let meta = TaskInsMeta {
        round: task.round,
        instruction,
    };

    write(buf, &meta, params)
}

pub(crate) fn read_task_ins(buf: &[u8]) -> io::Result<TaskIns> {
    let (meta, mut reader): (TaskInsMeta, _) = read(buf)?;

    let instruction = match meta.instruction {
        InstructionMeta::Fit { params, config } => Instruction::Fit(FitIns {
            parameters: reader.params(params)?,
            config,
        }),
        InstructionMeta::Evaluate { params, config } => Instruction::Evaluate(EvaluateIns {
            parameters: reader.params(params)?,
            config,
        }),
        InstructionMeta::GetParameters { config } => {
            Instruction::GetParameters(GetParametersIns { config })
        }
        InstructionMeta::GetProperties { config } => {
            Instruction::GetProperties(GetPropertiesIns { config })
        }
        InstructionMeta::Reconnect { seconds } => Instruction::Reconnect(ReconnectIns { seconds }),
        InstructionMeta::Stop => Instruction::Stop,
    };

    reader.finish()?;

    Ok(TaskIns {
        round: meta.round,
        instruction,
    })
}

pub(crate) fn write_task_res(buf: &mut Vec<u8>, task: &TaskRes) -> io::Result<()> {
    let (reply, params) = match &task.reply {
        Reply::Fit(res) => (
            ReplyMeta::Fit {
                params: params_meta(&res.parameters),
                num_examples: res.num_examples,
                metrics: res.metrics.clone(),
            },
            Some(&res.parameters),
        ),
        Reply::Evaluate(res) => (
            ReplyMeta::Evaluate {
                loss: res.loss,
                num_examples: res.num_examples,
                metrics: res.metrics.clone(),
            },
            None,
        ),
        Reply::GetParameters(res) => (
            ReplyMeta::GetParameters {
                params: params_meta(&res.parameters),
            },
            Some(&res.parameters),
        ),
        Reply::GetProperties(res) => (
            ReplyMeta::GetProperties {
                properties: res.properties.clone(),
            },
            None,
        ),
        Reply::Disconnect(res) => (
            ReplyMeta::Disconnect {
                reason: res.reason.clone(),
            },
            None,
        ),
    };

    let meta = TaskResMeta {
        client_id: task.client_id.clone(),
        round: task.round,
        reply,
    };

    write(buf, &meta, params)
}

pub(crate) fn read_task_res(buf: &[u8]) -> io::Result<TaskRes> {
    let (meta, mut reader): (TaskResMeta, _) = read(buf)?;

    let reply = match meta.reply {
        ReplyMeta::Fit {
            params,
            num_examples,
            metrics,
        } => Reply::Fit(FitRes {
            parameters: reader.params(params)?,
            num_examples,
            metrics,
        }),
        ReplyMeta::Evaluate {
            loss,
            num_examples,
            metrics,
        } => Reply::Evaluate(EvaluateRes {
            loss,
            num_examples,
            metrics,
        }),
        ReplyMeta::GetParameters { params } => Reply::GetParameters(GetParametersRes {
            parameters: reader.params(params)?,
        }),
        ReplyMeta::GetProperties { properties } => {
            Reply::GetProperties(GetPropertiesRes { properties })
        }
        ReplyMeta::Disconnect { reason } => Reply::Disconnect(DisconnectRes { reason }),
    };

    reader.finish()?;

    Ok(TaskRes {
        client_id: meta.client_id,
        round: meta.round,
        reply,
    })
}
