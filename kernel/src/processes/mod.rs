pub mod process;
pub mod registers;
pub mod scheduler;
pub mod switch;
