pub mod gateway;
pub mod modbus;
pub mod motion;
pub mod registers;

pub use gateway::Gateway;
pub use modbus::{LinkError, ModbusLink};
pub use motion::{MotionPort, TcpMotionAdapter};
pub use registers::RegisterStore;
