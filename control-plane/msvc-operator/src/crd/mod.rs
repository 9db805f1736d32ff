pub mod microservice;
