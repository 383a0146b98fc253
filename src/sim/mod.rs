pub mod simulated_transport;
