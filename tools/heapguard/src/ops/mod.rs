pub mod archive;
pub mod budget;
pub mod dump;
pub mod launch;
pub mod limits;
pub mod oom;
pub mod terminate;
pub mod upload;
pub mod util;
