pub mod reattach_information;
