pub mod routes;
pub mod security;
pub mod server;

#[cfg(test)]
mod tests;
