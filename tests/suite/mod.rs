mod divination;
mod failover;
mod history;
