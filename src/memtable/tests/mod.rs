mod tests_budget;
mod tests_sealed;
