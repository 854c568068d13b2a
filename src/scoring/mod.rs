//! Sale price scoring service.
//!
//! `GET /ping` answers a liveness check; `POST /score` prices one housing
//! record or an array of them and optionally records the results in InfluxDB.

mod influx;
mod record;
mod scorer;
mod server;

pub use server::serve;
