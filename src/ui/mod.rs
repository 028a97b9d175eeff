pub mod dap;
