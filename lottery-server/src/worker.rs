//! Per-connection state machine.
//!
//! A connection either submits batches (optionally announced by `NEW_BET`)
//! and ends with `ALL_SENT`, or asks once for its winners with `BET_RESULT`.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    bet::Bet,
    draw::FinishOutcome,
    message::{
        ALL_SENT, BET_RESULT, ClientMessage, DecodeError, NEW_BET, ReadError, ServerMessage,
        read_message, write_response,
    },
    server::ServerState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingCommand,
    IngestingBatches,
    Closed,
}

#[derive(Debug, Default)]
struct Session {
    agency: Option<u32>,
    stored: usize,
}

/// Serves one agency connection until its command sequence ends.
///
/// Errors end this connection only; shared state already committed stays.
pub async fn handle_connection<S>(mut stream: S, state: &ServerState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::default();
    let mut phase = Phase::AwaitingCommand;

    while phase != Phase::Closed {
        let message = match read_message(&mut stream).await {
            Ok(message) => message,
            Err(ReadError::Decode(err)) => return reject(&mut stream, err).await,
            Err(ReadError::Frame(err)) => {
                return Err(err).with_context(|| format!("reading message while {phase:?}"));
            }
        };

        phase = match (phase, message) {
            (Phase::AwaitingCommand, ClientMessage::NewBet) => Phase::IngestingBatches,
            (_, ClientMessage::Batch(bets)) => {
                ingest_batch(&mut stream, state, &mut session, bets).await?;
                Phase::IngestingBatches
            }
            (_, ClientMessage::AllSent { agency }) => {
                let Some(agency) = agency.or(session.agency) else {
                    return reject(&mut stream, DecodeError::UnidentifiedAgency).await;
                };
                finish_agency(state, &session, agency).await;
                Phase::Closed
            }
            (Phase::AwaitingCommand, ClientMessage::BetResult { agency }) => {
                answer_draw(&mut stream, state, agency).await?;
                Phase::Closed
            }
            (_, ClientMessage::NewBet) => {
                let err = DecodeError::UnexpectedCommand {
                    command: NEW_BET,
                    context: "after batches were sent",
                };
                return reject(&mut stream, err).await;
            }
            (_, ClientMessage::BetResult { .. }) => {
                return reject(&mut stream, bet_result_before_all_sent()).await;
            }
        };
    }

    close(&mut stream).await;
    Ok(())
}

async fn ingest_batch<S>(
    stream: &mut S,
    state: &ServerState,
    session: &mut Session,
    bets: Vec<Bet>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let accepted = bets.len();
    let agency = bets.first().map(|bet| bet.agency);

    state
        .store()
        .append_batch(bets)
        .await
        .context("action: apuesta_recibida | result: fail")?;
    info!(
        agency = ?agency,
        cantidad = accepted,
        "action: apuesta_recibida | result: success"
    );

    let ack = ServerMessage::Ack {
        accepted,
        cumulative: session.stored,
    };
    session.stored += accepted;
    session.agency = session.agency.or(agency);

    write_response(stream, &ack)
        .await
        .context("sending batch acknowledgement")?;
    Ok(())
}

async fn finish_agency(state: &ServerState, session: &Session, agency: u32) {
    match state.draw().mark_finished(agency).await {
        FinishOutcome::Recorded { finished } => info!(
            agency,
            cantidad = session.stored,
            finished,
            total = state.draw().total_agencies(),
            "action: total_apuestas_recibidas | result: success"
        ),
        FinishOutcome::AlreadyFinished => {
            warn!(agency, "{ALL_SENT} repeated by an agency that already finished")
        }
        FinishOutcome::BarrierFull => {
            warn!(agency, "{ALL_SENT} received after every agency finished")
        }
    }
}

async fn answer_draw<S>(stream: &mut S, state: &ServerState, agency: u32) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let draw = state.draw();

    if !draw.may_have_finished(agency).await {
        return reject(stream, bet_result_before_all_sent()).await;
    }

    let response = if draw.is_ready().await {
        let winners = draw
            .winners_for(agency, state.store())
            .await
            .context("action: consulta_ganadores | result: fail")?;
        info!(
            agency,
            cant_ganadores = winners.len(),
            "action: consulta_ganadores | result: success"
        );
        ServerMessage::Winners(winners)
    } else {
        debug!(agency, "action: consulta_ganadores | result: not_ready");
        ServerMessage::NotReady
    };

    write_response(stream, &response)
        .await
        .context("sending draw result")?;
    Ok(())
}

fn bet_result_before_all_sent() -> DecodeError {
    DecodeError::UnexpectedCommand {
        command: BET_RESULT,
        context: "before ALL_SENT",
    }
}

/// Answers `ERR_INVALID_BET`, closes the connection and reports `err`.
async fn reject<S>(stream: &mut S, err: DecodeError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if let Err(write_err) = write_response(stream, &ServerMessage::InvalidBet).await {
        debug!(error = ?write_err, "failed to deliver rejection");
    }
    close(stream).await;
    Err(anyhow::Error::new(err).context("rejected message from agency"))
}

async fn close<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    if let Err(err) = stream.shutdown().await {
        debug!(error = ?err, "failed to shut down connection cleanly");
    }
}
