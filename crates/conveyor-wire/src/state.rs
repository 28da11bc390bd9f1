// Text lines used to persist receiver and sender sequencing state.
//   recv <queue> <eofs> <flushes> <expecting>...
//   flushed <queue> <replica> <seq>
//   robin <cur> <seq>...
//   shard <seq>...
use crate::{Error, Result};
use conveyor_common::{ReplicaId, Seq};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLine {
    Recv {
        queue: String,
        eofs: u32,
        flushes: u32,
        expecting: Vec<Seq>,
    },
    /// Seq of the last FLUSH a receiver took from one upstream replica.
    Flushed {
        queue: String,
        replica: ReplicaId,
        seq: Seq,
    },
    Robin {
        cur: usize,
        seqs: Vec<Seq>,
    },
    Shard {
        seqs: Vec<Seq>,
    },
}

impl StateLine {
    pub fn tag(&self) -> &'static str {
        match self {
            StateLine::Recv { .. } => "recv",
            StateLine::Flushed { .. } => "flushed",
            StateLine::Robin { .. } => "robin",
            StateLine::Shard { .. } => "shard",
        }
    }
}

impl fmt::Display for StateLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seqs = match self {
            StateLine::Recv {
                queue,
                eofs,
                flushes,
                expecting,
            } => {
                write!(f, "recv {queue} {eofs} {flushes}")?;
                expecting
            }
            StateLine::Flushed {
                queue,
                replica,
                seq,
            } => return write!(f, "flushed {queue} {replica} {seq}"),
            StateLine::Robin { cur, seqs } => {
                write!(f, "robin {cur}")?;
                seqs
            }
            StateLine::Shard { seqs } => {
                f.write_str("shard")?;
                seqs
            }
        };
        for seq in seqs {
            write!(f, " {seq}")?;
        }
        Ok(())
    }
}

impl FromStr for StateLine {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let tag = parts
            .next()
            .ok_or_else(|| Error::State("empty line".to_string()))?;
        match tag {
            "recv" => {
                let queue = parts
                    .next()
                    .ok_or_else(|| Error::State(format!("missing queue name: {line}")))?
                    .to_string();
                let eofs = number(parts.next(), "eof count", line)?;
                let flushes = number(parts.next(), "flush count", line)?;
                let expecting = seqs(parts, line)?;
                Ok(StateLine::Recv {
                    queue,
                    eofs,
                    flushes,
                    expecting,
                })
            }
            "flushed" => {
                let queue = parts
                    .next()
                    .ok_or_else(|| Error::State(format!("missing queue name: {line}")))?
                    .to_string();
                let replica = number(parts.next(), "replica", line)?;
                let seq = number(parts.next(), "seq", line)?;
                if parts.next().is_some() {
                    return Err(Error::State(format!("trailing fields: {line}")));
                }
                Ok(StateLine::Flushed {
                    queue,
                    replica,
                    seq,
                })
            }
            "robin" => {
                let cur = number(parts.next(), "cursor", line)?;
                Ok(StateLine::Robin {
                    cur,
                    seqs: seqs(parts, line)?,
                })
            }
            "shard" => Ok(StateLine::Shard {
                seqs: seqs(parts, line)?,
            }),
            other => Err(Error::State(format!("unknown tag {other}: {line}"))),
        }
    }
}

fn number<T: FromStr>(part: Option<&str>, what: &str, line: &str) -> Result<T> {
    part.ok_or_else(|| Error::State(format!("missing {what}: {line}")))?
        .parse()
        .map_err(|_| Error::State(format!("{what} is not a number: {line}")))
}

fn seqs<'a>(parts: impl Iterator<Item = &'a str>, line: &str) -> Result<Vec<Seq>> {
    let seqs = parts
        .map(|part| {
            part.parse::<Seq>()
                .map_err(|_| Error::State(format!("seq {part} is not a number: {line}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if seqs.is_empty() {
        return Err(Error::State(format!("no sequence numbers: {line}")));
    }
    Ok(seqs)
}
