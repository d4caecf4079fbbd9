//! Application messages exchanged between agencies and the server.
//!
//! Agencies send framed UTF-8 payloads (see [`crate::frame`]). The server
//! answers with one newline-terminated text line per request.

use std::string::FromUtf8Error;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    bet::{Bet, parse_integer},
    frame::{self, FrameError},
};

pub const NEW_BET: &str = "NEW_BET";
pub const ALL_SENT: &str = "ALL_SENT";
pub const BET_RESULT: &str = "BET_RESULT";
pub const ERR_INVALID_BET: &str = "ERR_INVALID_BET";
pub const NOT_READY: &str = "NOT_READY";
pub const NO_WINNERS: &str = "NO_WINNERS";

const RECORD_DELIMITER: char = '|';
const ARGUMENT_DELIMITER: char = ',';

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("payload is empty")]
    Empty,
    #[error("record has {found} fields, expected {expected}")]
    FieldCount { found: usize, expected: usize },
    #[error("{field} {value:?} is not a valid unsigned integer")]
    InvalidInteger { field: &'static str, value: String },
    #[error("agency id must be positive")]
    NonPositiveAgency,
    #[error("document {value:?} is not a numeric identifier")]
    InvalidDocument { value: String },
    #[error("{field} contains a control character")]
    ControlCharacter { field: &'static str },
    #[error("ALL_SENT from a connection without batches must name its agency")]
    UnidentifiedAgency,
    #[error("birthdate {value:?} is not an ISO date")]
    InvalidDate { value: String },
    #[error("malformed {command} command")]
    MalformedCommand { command: &'static str },
    #[error("{command} is not allowed {context}")]
    UnexpectedCommand {
        command: &'static str,
        context: &'static str,
    },
    #[error("unrecognized response {0:?}")]
    UnknownResponse(String),
}

/// Failure to obtain the next message from an agency.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Messages an agency sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Announces that batches follow on this connection.
    NewBet,
    /// One or more bets; never empty.
    Batch(Vec<Bet>),
    /// The agency has no further batches. Without an id, the agency is
    /// taken from the bets sent earlier on the connection.
    AllSent { agency: Option<u32> },
    /// Asks for the winners belonging to `agency`.
    BetResult { agency: u32 },
}

impl ClientMessage {
    pub fn parse(payload: &str) -> Result<Self, DecodeError> {
        let payload = payload.trim_end();
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        if payload == NEW_BET {
            return Ok(Self::NewBet);
        }
        if payload == ALL_SENT {
            return Ok(Self::AllSent { agency: None });
        }
        if let Some(agency) = command_argument(payload, ALL_SENT) {
            return Ok(Self::AllSent {
                agency: Some(parse_agency(agency, ALL_SENT)?),
            });
        }
        if payload == BET_RESULT {
            return Err(DecodeError::MalformedCommand {
                command: BET_RESULT,
            });
        }
        if let Some(agency) = command_argument(payload, BET_RESULT) {
            return Ok(Self::BetResult {
                agency: parse_agency(agency, BET_RESULT)?,
            });
        }

        parse_batch(payload).map(Self::Batch)
    }

    pub fn encode(&self) -> String {
        match self {
            Self::NewBet => NEW_BET.to_string(),
            Self::Batch(bets) => join_records(bets),
            Self::AllSent { agency: None } => ALL_SENT.to_string(),
            Self::AllSent {
                agency: Some(agency),
            } => format!("{ALL_SENT}{ARGUMENT_DELIMITER}{agency}"),
            Self::BetResult { agency } => format!("{BET_RESULT}{ARGUMENT_DELIMITER}{agency}"),
        }
    }
}

/// Responses the server sends back, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `accepted` bets were stored; `cumulative` were stored earlier on the
    /// same connection.
    Ack { accepted: usize, cumulative: usize },
    InvalidBet,
    NotReady,
    /// Winners for the querying agency. Empty encodes as `NO_WINNERS`.
    Winners(Vec<Bet>),
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        let mut line = match self {
            Self::Ack {
                accepted,
                cumulative,
            } => format!("{accepted}{ARGUMENT_DELIMITER}{cumulative}"),
            Self::InvalidBet => ERR_INVALID_BET.to_string(),
            Self::NotReady => NOT_READY.to_string(),
            Self::Winners(bets) if bets.is_empty() => NO_WINNERS.to_string(),
            Self::Winners(bets) => join_records(bets),
        };
        line.push('\n');
        line
    }

    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim_end();
        match line {
            ERR_INVALID_BET => return Ok(Self::InvalidBet),
            NOT_READY => return Ok(Self::NotReady),
            NO_WINNERS => return Ok(Self::Winners(Vec::new())),
            "" => return Err(DecodeError::Empty),
            _ => {}
        }

        if let Some((accepted, cumulative)) = line.split_once(ARGUMENT_DELIMITER) {
            if !cumulative.contains(ARGUMENT_DELIMITER) {
                let accepted = parse_integer("accepted", accepted)
                    .map_err(|_| DecodeError::UnknownResponse(line.to_string()))?;
                let cumulative = parse_integer("cumulative", cumulative)
                    .map_err(|_| DecodeError::UnknownResponse(line.to_string()))?;
                return Ok(Self::Ack {
                    accepted: accepted as usize,
                    cumulative: cumulative as usize,
                });
            }
        }

        parse_batch(line).map(Self::Winners)
    }
}

/// Reads and decodes the next message from an agency.
pub async fn read_message<R>(reader: &mut R) -> Result<ClientMessage, ReadError>
where
    R: AsyncRead + Unpin,
{
    let payload = frame::read_frame(reader).await?;
    let payload = String::from_utf8(payload).map_err(DecodeError::from)?;
    Ok(ClientMessage::parse(&payload)?)
}

/// Frames and sends a message to the server.
pub async fn write_message<W>(writer: &mut W, message: &ClientMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_frame(writer, message.encode().as_bytes()).await
}

/// Sends a response line to an agency.
pub async fn write_response<W>(writer: &mut W, response: &ServerMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_all(writer, response.encode().as_bytes()).await
}

/// Decodes a `|`-separated batch. Any bad record rejects the whole batch.
pub fn parse_batch(payload: &str) -> Result<Vec<Bet>, DecodeError> {
    payload
        .split(RECORD_DELIMITER)
        .map(Bet::parse_record)
        .collect()
}

fn join_records(bets: &[Bet]) -> String {
    bets.iter()
        .map(Bet::to_string)
        .collect::<Vec<_>>()
        .join(&RECORD_DELIMITER.to_string())
}

fn command_argument<'a>(payload: &'a str, command: &str) -> Option<&'a str> {
    payload
        .strip_prefix(command)?
        .strip_prefix(ARGUMENT_DELIMITER)
}

fn parse_agency(value: &str, command: &'static str) -> Result<u32, DecodeError> {
    match value.trim().parse::<u32>() {
        Ok(0) | Err(_) => Err(DecodeError::MalformedCommand { command }),
        Ok(agency) => Ok(agency),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bet(record: &str) -> Bet {
        Bet::parse_record(record).expect("valid record")
    }

    #[test]
    fn parses_control_commands() {
        assert_eq!(ClientMessage::parse("NEW_BET").unwrap(), ClientMessage::NewBet);
        assert_eq!(
            ClientMessage::parse("ALL_SENT\n").unwrap(),
            ClientMessage::AllSent { agency: None }
        );
        assert_eq!(
            ClientMessage::parse("ALL_SENT,4").unwrap(),
            ClientMessage::AllSent { agency: Some(4) }
        );
        assert_eq!(
            ClientMessage::parse("BET_RESULT,3").unwrap(),
            ClientMessage::BetResult { agency: 3 }
        );
    }

    #[test]
    fn commands_are_case_sensitive() {
        // A lowercase token is not a command, and as a batch it has one field.
        assert!(matches!(
            ClientMessage::parse("all_sent"),
            Err(DecodeError::FieldCount { found: 1, .. })
        ));
    }

    #[test]
    fn rejects_malformed_bet_result() {
        for payload in ["BET_RESULT", "BET_RESULT,", "BET_RESULT,abc", "BET_RESULT,0"] {
            assert!(
                matches!(
                    ClientMessage::parse(payload),
                    Err(DecodeError::MalformedCommand { command: BET_RESULT })
                ),
                "{payload} should be rejected"
            );
        }
    }

    #[test]
    fn parses_batch_with_newline_terminated_records() {
        let payload = "1,Ana,Ruiz,1,2000-01-01,7\n|1,Juan,Gil,2,1990-05-17,8\n";
        let message = ClientMessage::parse(payload).expect("valid batch");

        let ClientMessage::Batch(bets) = message else {
            panic!("expected batch, got {message:?}");
        };
        assert_eq!(bets.len(), 2);
        assert_eq!(bets[1].to_string(), "1,Juan,Gil,2,1990-05-17,8");
    }

    #[test]
    fn one_bad_record_rejects_the_batch() {
        let payload = "1,Ana,Ruiz,1,2000-01-01,7|1,Juan,Gil,2,1990-05-17";
        assert!(matches!(
            ClientMessage::parse(payload),
            Err(DecodeError::FieldCount { found: 5, .. })
        ));

        let payload = "1,Ana,Ruiz,1,2000-01-01,7|1,Juan,Gil,2,1990-05-17,8,9";
        assert!(matches!(
            ClientMessage::parse(payload),
            Err(DecodeError::FieldCount { found: 7, .. })
        ));

        assert!(matches!(
            ClientMessage::parse("1,Ana,Ruiz,1,2000-01-01,7|"),
            Err(DecodeError::FieldCount { found: 1, .. })
        ));
    }

    #[test]
    fn encodes_responses() {
        assert_eq!(
            ServerMessage::Ack {
                accepted: 3,
                cumulative: 10
            }
            .encode(),
            "3,10\n"
        );
        assert_eq!(ServerMessage::InvalidBet.encode(), "ERR_INVALID_BET\n");
        assert_eq!(ServerMessage::NotReady.encode(), "NOT_READY\n");
        assert_eq!(ServerMessage::Winners(Vec::new()).encode(), "NO_WINNERS\n");
        assert_eq!(
            ServerMessage::Winners(vec![
                bet("1,Ana,Ruiz,1,2000-01-01,7"),
                bet("1,Juan,Gil,2,1990-05-17,7"),
            ])
            .encode(),
            "1,Ana,Ruiz,1,2000-01-01,7|1,Juan,Gil,2,1990-05-17,7\n"
        );
    }

    #[test]
    fn parses_responses() {
        assert_eq!(
            ServerMessage::parse("1,0\n").unwrap(),
            ServerMessage::Ack {
                accepted: 1,
                cumulative: 0
            }
        );
        assert_eq!(ServerMessage::parse("NOT_READY").unwrap(), ServerMessage::NotReady);
        assert_eq!(
            ServerMessage::parse("NO_WINNERS\n").unwrap(),
            ServerMessage::Winners(Vec::new())
        );
        assert_eq!(
            ServerMessage::parse("1,Ana,Ruiz,1,2000-01-01,7").unwrap(),
            ServerMessage::Winners(vec![bet("1,Ana,Ruiz,1,2000-01-01,7")])
        );
        assert!(matches!(
            ServerMessage::parse("a,b"),
            Err(DecodeError::UnknownResponse(_))
        ));
    }

    #[tokio::test]
    async fn message_travels_through_a_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let batch = ClientMessage::Batch(vec![bet("2,Eva,Sosa,9,1985-02-03,1234")]);

        write_message(&mut client, &batch).await.expect("write message");
        let received = read_message(&mut server).await.expect("read message");

        assert_eq!(received, batch);
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_decode_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        frame::write_frame(&mut client, &[0xff, 0xfe])
            .await
            .expect("write frame");

        let err = read_message(&mut server).await.expect_err("invalid payload");
        assert!(matches!(err, ReadError::Decode(DecodeError::InvalidUtf8(_))));
    }
}
