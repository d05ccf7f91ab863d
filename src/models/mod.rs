pub mod activationmodels;
