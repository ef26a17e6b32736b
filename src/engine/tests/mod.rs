mod helpers;

mod tests_batch;
mod tests_crash;
