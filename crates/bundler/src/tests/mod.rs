mod cluster_test;
