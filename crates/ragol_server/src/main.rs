use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};

use crate::scheduler::TickAction;
use crate::ship::{LoadedData, Ship};
use crate::shipgate::ShipgateHandle;

mod bans;
mod block;
mod client;
mod commands;
mod config_provider;
mod items;
mod lobby;
mod map;
mod quests;
mod scheduler;
mod scripts;
mod send;
mod ship;
mod shipgate;
mod subcmd;

#[cfg(test)]
mod server_test;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    info!("Ragol ship server startup");

    let provider = config_provider::default_config_provider();
    let cfg = provider.ship_config();

    let loaded = LoadedData::load(&cfg);

    let (sg_handle, sg_rx) = ShipgateHandle::new();
    let ship = Ship::new(cfg, sg_handle, loaded);

    shipgate::spawn(ship.clone(), sg_rx);

    for block in ship.blocks.iter() {
        if let Err(e) = block::spawn_listeners(ship.clone(), block.clone()).await {
            error!("cannot start block {:02}: {}", block.b, e);
            return;
        }
    }

    // The ship loop's lifetime IS the ship's: it runs until the scheduler
    // fires a shutdown or restart. An interrupt just schedules one.
    let mut ship_loop = tokio::spawn(ship_task(ship.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            ship.scheduler.schedule(scheduler::ShutdownKind::Shutdown, 0);
            let _ = (&mut ship_loop).await;
        }
        _ = &mut ship_loop => {
            // A GM-scheduled shutdown ran its course.
        }
    }

    // Give the final warnings and disconnects a moment to flush.
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// The ship's own periodic work: scheduler ticks, ban pruning and the
/// client/game count heartbeat. Returns when a scheduled shutdown or
/// restart executes, which ends the process.
async fn ship_task(ship: Arc<Ship>) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tick.tick().await;

        ship.bans.prune(unix_now());

        match ship.scheduler.tick(Instant::now()) {
            Some(TickAction::Warn { kind, minutes }) => {
                let verb = match kind {
                    scheduler::ShutdownKind::Shutdown => "shut down",
                    scheduler::ShutdownKind::Restart => "restart",
                };

                let msg = format!(
                    "\tE\tC4The ship will {} in\nabout {} minute{}.",
                    verb,
                    minutes,
                    if minutes == 1 { "" } else { "s" }
                );

                for block in ship.blocks.iter() {
                    let clients = block.clients.read().unwrap_or_else(|e| e.into_inner());
                    for c in clients.iter() {
                        send::send_txt(c, &msg);
                    }
                }
            }

            Some(TickAction::Execute(kind)) => {
                info!("scheduled {:?} executing, disconnecting all clients", kind);

                for block in ship.blocks.iter() {
                    let clients = block.clients.read().unwrap_or_else(|e| e.into_inner());
                    for c in clients.iter() {
                        send::send_msg_box(c, "\tEThe ship is going down.\nPlease try another ship.");
                        c.disconnect();
                    }
                }

                return;
            }

            None => {}
        }
    }
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
