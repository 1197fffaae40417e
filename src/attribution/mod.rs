//! Attribution runs: submission, step-tracked execution and read views.
//!
//! | Module       | Role                                                     |
//! |--------------|----------------------------------------------------------|
//! | `submission` | Validate and normalize inbound requests                  |
//! | `calendar`   | US/Eastern trading-day alignment                         |
//! | `store`      | Concurrent run store with snapshot reads                 |
//! | `db`         | SQLite persistence behind the store                      |
//! | `events`     | Run lifecycle notifications                              |
//! | `pipeline`   | Step definitions and outcomes                            |
//! | `steps`      | The six attribution steps                                |
//! | `providers`  | Retrieval, mining, audit and judging collaborators       |
//! | `runner`     | Orchestrator: retries, timeouts, cancellation, resume    |
//! | `query`      | Status / result / export projections                     |
//! | `export`     | IR and PDF outline renderings                            |
//! | `api`        | HTTP handlers                                            |
//! | `ws`         | Run event WebSocket                                      |
//! | `server`     | Router assembly and server lifecycle                     |

pub mod api;
pub mod calendar;
pub mod db;
pub mod events;
pub mod export;
pub mod pipeline;
pub mod providers;
pub mod query;
pub mod runner;
pub mod server;
pub mod steps;
pub mod store;
pub mod submission;
pub mod ws;
