//! Stream driver
//!
//! Pumps one turn's mailbox through a [`StreamTranslator`] on a background
//! task and hands the encoded SSE frames to the caller as a byte stream.

use super::sse::SseFrame;
use super::stream::{StreamAction, StreamOptions, StreamTranslator};
use crate::rpc::{TurnEvent, TurnHandle};
use bytes::Bytes;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, Sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use workergate_transport::{ErrorCode, TransportError};

/// Encoded SSE frames of one completion
pub type SseStream = ReceiverStream<Bytes>;

const FRAME_BUFFER: usize = 32;

/// Stream a turn as `chat.completion.chunk` frames
///
/// The stream always ends with `data: [DONE]` unless the receiver is dropped
/// first, which cancels the turn.
pub fn stream_chat_completion(turn: TurnHandle, options: StreamOptions) -> SseStream {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(drive(turn, options, tx));
    ReceiverStream::new(rx)
}

async fn drive(mut turn: TurnHandle, options: StreamOptions, tx: mpsc::Sender<Bytes>) {
    let mut translator = StreamTranslator::new(&options);
    let idle_timeout = options.config.idle_timeout;

    if !send_all(&tx, translator.start()).await {
        turn.cancel();
        return;
    }

    let idle = tokio::time::sleep(idle_timeout);
    let deadline = tokio::time::sleep(turn.turn_timeout());
    tokio::pin!(idle, deadline);
    let mut cutoff: Option<Pin<Box<Sleep>>> = None;
    let mut keepalive = options
        .config
        .keepalive_interval
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        let frames = tokio::select! {
            _ = tx.closed() => {
                debug!(completion_id = %translator.id(), "client went away");
                turn.cancel();
                return;
            }
            event = turn.next_event() => match event {
                Some(TurnEvent::Backend(event)) => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    let step = translator.on_event(event);
                    match step.action {
                        StreamAction::Continue => {}
                        StreamAction::ArmCutoff(grace) => {
                            cutoff = Some(Box::pin(tokio::time::sleep(grace)));
                        }
                        StreamAction::Cut => {
                            turn.abort(TransportError::aborted("stopped after tool block"));
                        }
                    }
                    step.frames
                }
                Some(TurnEvent::End(outcome)) => translator.on_end(&outcome),
                Some(TurnEvent::Failed(err)) => translator.on_error(&err),
                None => translator.on_error(&TransportError::worker_exited(
                    "turn closed without an outcome",
                )),
            },
            _ = &mut idle => {
                let err = TransportError::new(
                    ErrorCode::StreamIdleTimeout,
                    format!("no backend output for {}ms", idle_timeout.as_millis()),
                );
                turn.abort(err.clone());
                translator.on_error(&err)
            }
            _ = &mut deadline => {
                let err = TransportError::new(
                    ErrorCode::TurnTimeout,
                    format!("turn exceeded {}ms", turn.turn_timeout().as_millis()),
                );
                turn.abort(err.clone());
                translator.on_error(&err)
            }
            _ = elapsed(&mut cutoff) => {
                cutoff = None;
                let frames = translator.on_cutoff();
                turn.abort(TransportError::aborted("stopped after tool burst"));
                frames
            }
            _ = tick(&mut keepalive) => translator.keepalive().into_iter().collect(),
        };

        if !send_all(&tx, frames).await {
            turn.cancel();
            return;
        }
        if translator.is_closed() {
            return;
        }
    }
}

async fn send_all(tx: &mpsc::Sender<Bytes>, frames: Vec<SseFrame>) -> bool {
    for frame in frames {
        if tx.send(frame.encode()).await.is_err() {
            return false;
        }
    }
    true
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
