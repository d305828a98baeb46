pub mod increment_pid;
