use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use kiln_process::{ClientFrame, ErrorPayload, ObserverId, ServerEvent};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    error::SupervisorError,
    error_payload,
    hub::EventSender,
    recovery::{self, EXIT_RESTART},
    state::AppState,
};

const NOT_RUNNING_REPLY: &str = "Server is not running.\r\n";

pub async fn observer_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_observer_socket(state, socket))
}

async fn handle_observer_socket(state: AppState, socket: WebSocket) {
    let observer = ObserverId::new();
    let span = tracing::info_span!("observer_ws", observer = %observer.0);
    async move {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

        let writer = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let text = match serde_json::to_string(&ev) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        tracing::debug!("observer connected");
        while let Some(msg) = receiver.next().await {
            let Ok(msg) = msg else { break };
            match msg {
                Message::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                        continue;
                    };
                    if runs_detached(&frame) {
                        let (state, observer, tx) = (state.clone(), observer.clone(), tx.clone());
                        tokio::spawn(
                            async move { dispatch(&state, &observer, &tx, frame).await }
                                .in_current_span(),
                        );
                    } else {
                        dispatch(&state, &observer, &tx, frame).await;
                    }
                }
                Message::Close(_) => break,
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
            }
        }

        state.manager.leave(&observer).await;
        drop(tx);
        writer.abort();
        tracing::debug!("observer disconnected");
    }
    .instrument(span)
    .await
}

/// Frames that may wait on an installer run or a supervisor shutdown. These run in their own
/// task so the socket keeps reading; their `resp` arrives when they finish.
fn runs_detached(frame: &ClientFrame) -> bool {
    matches!(
        frame,
        ClientFrame::Start { .. } | ClientFrame::RestartSupervisor { .. }
    )
}

/// Apply one client frame. Frames with an `id` get exactly one `resp` back on `tx`.
pub async fn dispatch(state: &AppState, observer: &ObserverId, tx: &EventSender, frame: ClientFrame) {
    let id = frame.request_id().map(str::to_string);
    let manager = &state.manager;

    let result: Result<(), ErrorPayload> = match frame {
        ClientFrame::Join { instance } => manager
            .join(&instance, observer.clone(), tx.clone())
            .await
            .map_err(|e| error_payload::from_supervisor(&e)),
        ClientFrame::JoinDashboard => {
            manager.join_dashboard(observer.clone(), tx.clone()).await;
            Ok(())
        }
        ClientFrame::Start { instance, .. } => manager
            .start(&instance)
            .await
            .map(|_| ())
            .map_err(|e| error_payload::from_supervisor(&e)),
        ClientFrame::Stop { instance, .. } => match manager.stop(&instance).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, SupervisorError::NotRunning) {
                    let _ = tx.send(ServerEvent::Output {
                        instance,
                        data: NOT_RUNNING_REPLY.to_string(),
                    });
                }
                Err(error_payload::from_supervisor(&e))
            }
        },
        ClientFrame::Command { instance, text } => {
            manager.send_input(&instance, &text).await;
            Ok(())
        }
        ClientFrame::Resize {
            instance,
            cols,
            rows,
        } => {
            manager.resize(&instance, cols, rows).await;
            Ok(())
        }
        ClientFrame::ScheduleRestart { instance, .. } => manager
            .schedule_restart(&instance)
            .await
            .map_err(|e| error_payload::from_supervisor(&e)),
        ClientFrame::CancelRestart { instance, .. } => manager
            .cancel_restart(&instance)
            .await
            .map_err(|e| error_payload::from_supervisor(&e)),
        ClientFrame::RestartSupervisor { .. } => {
            recovery::restart_supervisor(manager, &state.exit, EXIT_RESTART)
                .await
                .map(|_| ())
                .map_err(|e| error_payload::from_supervisor(&e))
        }
        ClientFrame::Unknown => Ok(()),
    };

    if let Err(err) = &result {
        tracing::debug!(code = %err.code, message = %err.message, "observer request failed");
    }
    if let Some(id) = id {
        let _ = tx.send(ServerEvent::Resp {
            id,
            ok: result.is_ok(),
            error: result.err(),
        });
    }
}
