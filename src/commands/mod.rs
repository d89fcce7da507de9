pub mod ps;
pub mod serve;
pub mod stop;
