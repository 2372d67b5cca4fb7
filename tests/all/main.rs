mod consumers;
mod helpers;
mod pipeline;
mod pool;
mod recovery;
