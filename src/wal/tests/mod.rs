mod helpers;

mod tests_batch;
