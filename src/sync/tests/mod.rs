mod tests_counter;
mod tests_retry;
