//! HTTP control surface.

pub mod auth;
pub mod rest;
