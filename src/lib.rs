pub mod coord_codec;
pub mod image_watcher;
pub mod result_channel;
pub mod solve_field;
pub mod solve_worker;
pub mod solver_trait;
pub mod stellarium_packet;
pub mod stellarium_server;
