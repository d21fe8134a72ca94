pub mod test_statemachine;
