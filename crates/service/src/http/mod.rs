//! Client-facing HTTP surface: accept loop + worker pools in [`server`],
//! route dispatch in [`routes`], `/v1/models` in [`models`].

mod models;
mod routes;
mod server;

pub use server::{request_shutdown, serve};
