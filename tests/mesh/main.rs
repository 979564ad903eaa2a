// Mesh end-to-end tests over the in-memory network

mod service_test;
