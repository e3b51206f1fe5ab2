//MIT License
pub mod solver;
