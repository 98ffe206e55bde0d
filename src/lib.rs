pub mod lb;
