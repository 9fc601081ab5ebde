//! Processor Task - daemon event, API request and timer processing
//!
//! One task owns every state transition in the crate: it selects over the
//! inbound daemon event channel, the API request channel and the earliest
//! timer deadline published by the monitor state machines, then applies the
//! winner against the shared [`Monitor`](crate::Monitor) state. Because all
//! mutation funnels through this single loop, the core logic never sees
//! shared-memory concurrency, only interleaved callbacks.
//!
//! # Usage
//!
//! Spawn [`run`] as an Embassy task with the application's `HostBus`
//! implementation:
//!
//! ```rust,no_run
//! use warbler::{MonitorOptions, processor};
//! # async fn example<B: warbler::HostBus>(bus: &B) {
//! processor::run(MonitorOptions::default(), bus).await;
//! # }
//! ```
//!
//! The IPC glue feeds daemon signals through [`crate::bus::submit`];
//! responses to outbound calls arrive on the same channel. Timers are plain
//! monotonic deadlines owned by devices, sessions and transports; the loop
//! sleeps until the earliest one and dispatches every deadline that has
//! passed. Stopping a timer is setting the deadline to `None`, which makes
//! stop idempotent by construction.

use embassy_futures::select::{Either, Either3, select, select3};
use embassy_time::{Instant, Timer};

use crate::bus::{BusEvent, HostBus};
use crate::{
    EVENT_CHANNEL, MonitorOptions, NOTIFICATION_CHANNEL, REQUEST_CHANNEL, RESPONSE_CHANNEL,
    Request, monitor,
};

enum Wake {
    Event(BusEvent),
    Request(Request),
    Deadline,
}

/// Run the monitor processor loop
///
/// # Panics
///
/// This function will panic if monitor initialization fails, i.e. when
/// `init_monitor` was already called by the application.
pub async fn run<B: HostBus>(options: MonitorOptions, bus: &B) -> ! {
    crate::init_monitor(options)
        .await
        .expect("Failed to initialize monitor");

    loop {
        let deadline = match monitor().await {
            Ok(guard) => guard.next_deadline(),
            Err(_) => None,
        };

        let wake = match deadline {
            Some(deadline) => {
                match select3(
                    EVENT_CHANNEL.receive(),
                    REQUEST_CHANNEL.receive(),
                    Timer::at(deadline),
                )
                .await
                {
                    Either3::First(event) => Wake::Event(event),
                    Either3::Second(request) => Wake::Request(request),
                    Either3::Third(()) => Wake::Deadline,
                }
            }
            None => match select(EVENT_CHANNEL.receive(), REQUEST_CHANNEL.receive()).await {
                Either::First(event) => Wake::Event(event),
                Either::Second(request) => Wake::Request(request),
            },
        };

        let now = Instant::now();
        match monitor().await {
            Ok(mut guard) => match wake {
                Wake::Event(event) => {
                    guard.handle_event(event, bus, now).await;
                }
                Wake::Request(request) => {
                    let response = guard.handle_request(request, bus, now).await;
                    drop(guard);
                    RESPONSE_CHANNEL.send(response).await;
                }
                Wake::Deadline => {
                    guard.handle_timeouts(bus, now).await;
                }
            },
            Err(e) => {
                error!("monitor not initialized: {}", e);
            }
        }

        // forward queued lifecycle notifications; a lagging consumer loses
        // the oldest ones rather than stalling the loop
        loop {
            let note = match monitor().await {
                Ok(mut guard) => guard.take_notification(),
                Err(_) => None,
            };
            let Some(note) = note else {
                break;
            };
            if NOTIFICATION_CHANNEL.try_send(note).is_err() {
                warn!("notification consumer lagging, dropping event");
            }
        }
    }
}
